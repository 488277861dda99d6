//! Error taxonomy for the supervision core.
//!
//! Every failure the core surfaces is a [`SupervisorError`]. Callers that need to branch
//! on the failure category use [`SupervisorError::kind`] instead of matching on payloads.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Discriminant of a [`SupervisorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PortInUse,
    ProcessStart,
    ProcessRestart,
    LockTimeout,
    LockReentrant,
    LogWrite,
    Config,
    Signal,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("port {port} is already in use (needed by '{process}' in group '{group}')")]
    PortInUse {
        group: String,
        process: String,
        port: u16,
    },

    #[error("failed to start '{process}' in group '{group}': {source}")]
    ProcessStart {
        group: String,
        process: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to restart '{process}' in group '{group}': {source}")]
    ProcessRestart {
        group: String,
        process: String,
        #[source]
        source: Box<SupervisorError>,
    },

    #[error(
        "timed out after {}ms waiting for lock {scope}:{key}{}",
        .waited.as_millis(),
        holder_suffix(.holder)
    )]
    LockTimeout {
        scope: String,
        key: String,
        waited: Duration,
        /// Pid recorded by the current holder, when readable.
        holder: Option<u32>,
    },

    #[error("lock {scope}:{key} is already held by this operation")]
    LockReentrant { scope: String, key: String },

    #[error("log {}: {message}", .path.display())]
    LogWrite { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::PortInUse { .. } => ErrorKind::PortInUse,
            SupervisorError::ProcessStart { .. } => ErrorKind::ProcessStart,
            SupervisorError::ProcessRestart { .. } => ErrorKind::ProcessRestart,
            SupervisorError::LockTimeout { .. } => ErrorKind::LockTimeout,
            SupervisorError::LockReentrant { .. } => ErrorKind::LockReentrant,
            SupervisorError::LogWrite { .. } => ErrorKind::LogWrite,
            SupervisorError::Config(_) => ErrorKind::Config,
            SupervisorError::Signal { .. } => ErrorKind::Signal,
        }
    }

    pub(crate) fn log_write(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        SupervisorError::LogWrite {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn config(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        SupervisorError::Config(format!("{context}: {err}"))
    }
}

fn holder_suffix(holder: &Option<u32>) -> String {
    holder
        .map(|pid| format!(" (held by pid {pid})"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_error_wraps_start_failure() {
        let inner = SupervisorError::PortInUse {
            group: "app".into(),
            process: "web".into(),
            port: 5000,
        };
        let err = SupervisorError::ProcessRestart {
            group: "app".into(),
            process: "web".into(),
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::ProcessRestart);
        let message = err.to_string();
        assert!(message.contains("failed to restart 'web'"));
        assert!(message.contains("port 5000"));
    }

    #[test]
    fn lock_timeout_message_reports_wait() {
        let err = SupervisorError::LockTimeout {
            scope: "group".into(),
            key: "app".into(),
            waited: Duration::from_millis(250),
            holder: None,
        };
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert_eq!(
            err.to_string(),
            "timed out after 250ms waiting for lock group:app"
        );

        let held = SupervisorError::LockTimeout {
            scope: "group".into(),
            key: "app".into(),
            waited: Duration::from_millis(250),
            holder: Some(99),
        };
        assert!(held.to_string().ends_with("(held by pid 99)"));
    }
}
