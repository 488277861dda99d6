//! stackvisor: supervision of grouped, long-running local processes.
//!
//! The library provides the supervision substrate used by the `stackvisor` binary:
//! persisted process records ([`state`]), group locks ([`lock`]), size-bounded log
//! capture ([`output`]) and the process lifecycle itself ([`runner`]). Every component
//! takes its root directory explicitly through [`config::Paths`].

pub mod config;
pub mod error;
pub mod lock;
pub mod output;
pub mod ports;
pub mod process;
pub mod runner;
pub mod state;

pub use config::{GroupDefinition, GroupResolver, Paths, Settings, TomlGroupResolver};
pub use error::{ErrorKind, Result, SupervisorError};
pub use lock::LockManager;
pub use output::LogCapture;
pub use ports::{PortChecker, TcpPortChecker};
pub use process::{CommandSpec, GroupMeta, ProcessState, ProcessStatus, StartOptions};
pub use runner::{CaptureMode, GroupEntry, GroupReport, Supervisor};
pub use state::StateStore;
