use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Timed out talking to remote host: {0}")]
    Timeout(String),
    #[error("Transport to remote host failed: {0}")]
    Transport(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Remote host identity could not be verified: {0}")]
    HostKey(String),
    #[error("Remote protocol error: {0}")]
    Protocol(String),
    #[error("Remote shell could not execute the command: {0}")]
    Path(String),
    #[error("Batch scheduler query failed: {0}")]
    SchedulerQuery(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("A target named '{0}' already exists")]
    DuplicateName(String),
    #[error("No target named '{0}'")]
    UnknownTarget(String),
    #[error("No connector registered for protocol '{0}'")]
    UnknownProtocol(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Task queue is no longer running")]
    QueueClosed,
    #[error("Task handler failed: {0}")]
    Handler(String),
    #[error("Local I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to (de)serialize YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RemoteError {
    /// Timeouts and broken transports.
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Timeout(_) | RemoteError::Transport(_))
    }

    /// Failures `Job::process` may retry when asked to.
    pub fn is_retryable(&self) -> bool {
        self.is_network() || matches!(self, RemoteError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RemoteError::Timeout("t".into()).is_retryable());
        assert!(RemoteError::Transport("t".into()).is_retryable());
        assert!(RemoteError::Protocol("t".into()).is_retryable());
        assert!(!RemoteError::Protocol("t".into()).is_network());
        assert!(!RemoteError::Auth("t".into()).is_retryable());
        assert!(!RemoteError::HostKey("t".into()).is_retryable());
        assert!(!RemoteError::Path("t".into()).is_retryable());
        assert!(!RemoteError::SchedulerQuery("t".into()).is_retryable());
    }
}
