use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// Invalid or missing setting. Raised before any remote call.
    Config(String),
    /// Scheduler or secret store unreachable, or rejecting a request.
    Transport(String),
    NotFound(String),
    Timeout {
        job_id: String,
        waited: Duration,
    },
    Cancelled,
    /// The remote attachment could not be established or was lost.
    RemoteExec(String),
    Phase {
        phase: &'static str,
        source: Box<WorkspaceError>,
    },
    Io(#[from] std::io::Error),
    Serialization(String),
    Other(#[from] anyhow::Error),
}

impl Display for WorkspaceError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            WorkspaceError::Config(s) => write!(f, "Configuration error: {}", s),
            WorkspaceError::Transport(s) => write!(f, "Transport error: {}", s),
            WorkspaceError::NotFound(s) => write!(f, "Not found: {}", s),
            WorkspaceError::Timeout { job_id, waited } => write!(
                f,
                "Timed out after {}s waiting for job '{}' to become ready",
                waited.as_secs(),
                job_id
            ),
            WorkspaceError::Cancelled => write!(f, "Operation cancelled"),
            WorkspaceError::RemoteExec(s) => write!(f, "Remote execution failed: {}", s),
            WorkspaceError::Phase { phase, source } => write!(f, "{} failed: {}", phase, source),
            WorkspaceError::Io(e) => write!(f, "I/O error: {}", e),
            WorkspaceError::Serialization(s) => write!(f, "Serialization error: {}", s),
            WorkspaceError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl WorkspaceError {
    /// Wrap this error with the name of the lifecycle phase that produced it.
    pub fn in_phase(self, phase: &'static str) -> Self {
        WorkspaceError::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// The innermost error, with phase wrappers removed.
    pub fn root(&self) -> &WorkspaceError {
        match self {
            WorkspaceError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), WorkspaceError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), WorkspaceError::Cancelled)
    }
}

impl From<serde_yaml_ng::Error> for WorkspaceError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        WorkspaceError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for WorkspaceError {
    fn from(err: serde_json::Error) -> Self {
        WorkspaceError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Attach a phase name to the error side of a result.
pub trait PhaseContext<T> {
    fn phase(self, phase: &'static str) -> Result<T>;
}

impl<T> PhaseContext<T> for Result<T> {
    fn phase(self, phase: &'static str) -> Result<T> {
        self.map_err(|e| e.in_phase(phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wrapping_keeps_root_kind() {
        let err = WorkspaceError::NotFound("volume devpod-a".into())
            .in_phase("lookup volume")
            .in_phase("delete workspace");

        assert!(err.is_not_found());
        assert!(!err.is_cancelled());
        assert_eq!(
            err.to_string(),
            "delete workspace failed: lookup volume failed: Not found: volume devpod-a"
        );
    }

    #[test]
    fn test_timeout_message_names_job() {
        let err = WorkspaceError::Timeout {
            job_id: "ws-1".into(),
            waited: Duration::from_secs(300),
        };
        let msg = err.to_string();
        assert!(msg.contains("ws-1"));
        assert!(msg.contains("300s"));
    }

    #[test]
    fn test_phase_context_on_result() {
        let res: Result<()> = Err(WorkspaceError::Transport("connection refused".into()));
        let err = res.phase("register job").unwrap_err();
        assert!(matches!(err, WorkspaceError::Phase { phase: "register job", .. }));
        assert!(matches!(err.root(), WorkspaceError::Transport(_)));
    }

    #[test]
    fn test_serde_errors_become_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: WorkspaceError = json_err.into();
        assert!(matches!(err, WorkspaceError::Serialization(_)));
    }
}
