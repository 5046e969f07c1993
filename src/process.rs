//! Lifecycle states of a supervised process.
//!
//! ```text
//! NotStarted -> Starting -> Running -> Stopping -> Stopped
//!                              |
//!                              +-> Exited { code } | Failed { error }
//! ```
//!
//! `Exited` with a non-zero code and `Failed` go back to `Starting` after the
//! restart delay.

use std::fmt;

/// The current lifecycle status of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Registered, never launched.
    NotStarted,
    /// Being launched.
    Starting,
    /// Process is actively running.
    Running { pid: Option<u32> },
    /// Interrupted by the supervisor, waiting for it to exit.
    Stopping,
    /// Stopped by the supervisor.
    Stopped,
    /// Process has exited on its own.
    Exited { code: Option<i32> },
    /// Process failed to start or could not be waited on.
    Failed { error: String },
}

impl ProcessStatus {
    /// Whether the process is launched or about to be.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running { .. } | ProcessStatus::Stopping
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::NotStarted => f.write_str("not started"),
            ProcessStatus::Starting => f.write_str("starting"),
            ProcessStatus::Running { pid: Some(pid) } => write!(f, "running (pid {})", pid),
            ProcessStatus::Running { pid: None } => f.write_str("running"),
            ProcessStatus::Stopping => f.write_str("stopping"),
            ProcessStatus::Stopped => f.write_str("stopped"),
            ProcessStatus::Exited { code: Some(code) } => write!(f, "exited ({})", code),
            ProcessStatus::Exited { code: None } => f.write_str("exited (signal)"),
            ProcessStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_in_flight_states_are_active() {
        assert!(ProcessStatus::Running { pid: Some(1) }.is_active());
        assert!(ProcessStatus::Stopping.is_active());
        assert!(!ProcessStatus::NotStarted.is_active());
        assert!(!ProcessStatus::Exited { code: Some(0) }.is_active());
    }

    #[test]
    fn display_includes_details() {
        assert_eq!(
            ProcessStatus::Running { pid: Some(42) }.to_string(),
            "running (pid 42)"
        );
        assert_eq!(
            ProcessStatus::Exited { code: Some(2) }.to_string(),
            "exited (2)"
        );
    }
}
