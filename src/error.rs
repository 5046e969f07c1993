//! Error types for procfly.
//!
//! - [`RunError`]: launching, waiting on or stopping one process.
//! - [`SupervisorError`]: run lock violations and fatal command group failures.
//! - [`RenderError`]: template conflicts, parse/execute failures and writes.
//! - [`DiscoveryError`]: private network lookups.
//!
//! Ordinary process failures stay inside the restart loop and are never
//! returned from [`Supervisor::run`](crate::supervisor::Supervisor::run).

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::scope::StopReason;

/// Errors from running a single command.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("allocate pty: {0}")]
    Pty(#[source] io::Error),

    #[error("start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("wait: {0}")]
    Wait(#[source] io::Error),

    /// The process exited non-zero or was killed by a signal it did not expect.
    #[error("{0}")]
    Exit(ExitStatus),

    /// The task running the command panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),

    /// The governing scope finished before the process did.
    #[error("{0}")]
    Stopped(StopReason),
}

impl RunError {
    /// The stop reason, if this error only reports that we stopped the process.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            RunError::Stopped(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Errors surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    /// An init command failed or timed out.
    #[error("init {name}: {source}")]
    Setup {
        name: String,
        #[source]
        source: RunError,
    },

    /// A reload command failed or timed out.
    #[error("reload {name}: {source}")]
    Reload {
        name: String,
        #[source]
        source: RunError,
    },
}

impl SupervisorError {
    /// Returns a short stable label for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyRunning => "already_running",
            SupervisorError::NotRunning => "not_running",
            SupervisorError::Setup { .. } => "setup_failure",
            SupervisorError::Reload { .. } => "reload_failure",
        }
    }
}

/// Errors from rendering templates.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The same destination appears as an inline and a file template.
    #[error("multiple templates: {}", .names.join(", "))]
    Conflict { names: Vec<String> },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    /// Building the value tree needed a discovery round trip that failed.
    #[error("lookup: {0}")]
    Lookup(#[from] DiscoveryError),
}

/// Errors from private network discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("resolve {query}: {source}")]
    Resolve {
        query: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },

    #[error("resolve {query}: timed out after {timeout:?}")]
    Timeout { query: String, timeout: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_lists_every_name() {
        let err = RenderError::Conflict {
            names: vec!["a.conf".into(), "b.conf".into()],
        };
        assert_eq!(err.to_string(), "multiple templates: a.conf, b.conf");
    }

    #[test]
    fn stopped_error_exposes_reason() {
        let err = RunError::Stopped(StopReason::DeadlineExceeded);
        assert_eq!(err.stop_reason(), Some(StopReason::DeadlineExceeded));
        assert_eq!(err.to_string(), "context deadline exceeded");

        let err = RunError::Wait(io::Error::other("gone"));
        assert_eq!(err.stop_reason(), None);
    }

    #[test]
    fn setup_error_names_the_command() {
        let err = SupervisorError::Setup {
            name: "init_migrate".into(),
            source: RunError::Stopped(StopReason::DeadlineExceeded),
        };
        assert_eq!(err.to_string(), "init init_migrate: context deadline exceeded");
        assert_eq!(err.as_label(), "setup_failure");
    }
}
