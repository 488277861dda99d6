//! Data structures for tracking process state.
//!
//! This module defines the declarative definition of a command (`CommandSpec`), its
//! persisted lifecycle status (`ProcessStatus`), and the record written to the state
//! store for every supervised process (`ProcessState`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Definition of a command belonging to a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    /// Friendly name of the command within its group.
    pub name: String,
    /// Shell command line, run through `sh -c`.
    pub command: String,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Environment variables added on top of the supervisor's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Ports the command claims once running.
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }
}

/// Display metadata copied onto every record of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMeta {
    pub group_key: Option<String>,
    pub group_label: Option<String>,
    pub repository_name: Option<String>,
    pub group_definition_name: Option<String>,
}

/// Per-start options that are not part of the command definition.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Overrides the configured log size bound.
    pub log_max_bytes: Option<u64>,
    /// Discard output instead of capturing it.
    pub logs_disabled: bool,
    pub meta: GroupMeta,
}

/// The persisted lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Error,
}

/// Record persisted for one (group, process) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_definition_name: Option<String>,
    pub process: String,
    pub status: ProcessStatus,
    /// Set iff `status` is `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Pid of the detached process copying output into the log, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
}

impl ProcessState {
    /// Creates a stopped record carrying only identity and group metadata.
    pub fn new(group: impl Into<String>, process: impl Into<String>, meta: &GroupMeta) -> Self {
        Self {
            group: group.into(),
            group_key: meta.group_key.clone(),
            group_label: meta.group_label.clone(),
            repository_name: meta.repository_name.clone(),
            group_definition_name: meta.group_definition_name.clone(),
            process: process.into(),
            status: ProcessStatus::Stopped,
            pid: None,
            capture_pid: None,
            command: None,
            started_at: None,
            stopped_at: None,
            error: None,
            log_path: None,
            log_max_bytes: None,
            logs_disabled: None,
            ports: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    /// Transitions the record to `Error`, clearing the pids.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = ProcessStatus::Error;
        self.pid = None;
        self.capture_pid = None;
        self.stopped_at = Some(Utc::now());
        self.error = Some(message.into());
    }

    /// Ports claimed by the record, empty when none were declared.
    pub fn claimed_ports(&self) -> &[u16] {
        self.ports.as_deref().unwrap_or(&[])
    }
}
