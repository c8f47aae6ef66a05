use thiserror::Error;

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Ledger gateway errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transaction rejected: {0}")]
    Submission(String),

    #[error("Filter creation failed for {event}: {reason}")]
    FilterCreation { event: String, reason: String },

    #[error("Filter {0} not found on node")]
    FilterNotFound(String),

    #[error("Contract call failed: {0}")]
    Call(String),

    // Event payload errors
    #[error("Malformed {event} event: {reason}")]
    MalformedEvent { event: String, reason: String },

    // Execution pipeline errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Command execution failed: {0}")]
    Execution(String),

    #[error("Command {cmd_id} failed: {source}")]
    Command {
        cmd_id: String,
        #[source]
        source: Box<AgentError>,
    },

    // Registration errors
    #[error("No registration confirmation within {timeout_secs}s")]
    RegistrationTimeout { timeout_secs: u64 },

    #[error("Registration abandoned after {attempts} attempts")]
    RegistrationExhausted { attempts: u32 },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Startup errors
    #[error("Node startup failed: {0}")]
    NodeStartup(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Address parsing error: {0}")]
    AddressParsing(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

/// What a caller should do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Recoverable: back off and try the operation again
    Retry,
    /// Drop the current event/command and keep running
    Skip,
    /// Cannot proceed: surface to the operator
    Fatal,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Retry => write!(f, "retry"),
            Disposition::Skip => write!(f, "skip"),
            Disposition::Fatal => write!(f, "fatal"),
        }
    }
}

impl AgentError {
    /// Decision table for retry vs. skip vs. fatal.
    ///
    /// Per-command failures inside the intake loop are always isolated to
    /// that command regardless of this value; the table decides how the
    /// registration driver and the startup path react.
    pub fn disposition(&self) -> Disposition {
        match self {
            AgentError::Transport(_)
            | AgentError::Submission(_)
            | AgentError::Call(_)
            | AgentError::FilterNotFound(_)
            | AgentError::RegistrationTimeout { .. }
            | AgentError::MalformedEvent { .. } => Disposition::Retry,

            AgentError::Crypto(_) | AgentError::Execution(_) | AgentError::Command { .. } => {
                Disposition::Skip
            }

            AgentError::Config(_)
            | AgentError::InvalidConfig(_)
            | AgentError::FilterCreation { .. }
            | AgentError::RegistrationExhausted { .. }
            | AgentError::InvalidStateTransition { .. }
            | AgentError::InvalidState(_)
            | AgentError::NodeStartup(_)
            | AgentError::Wallet(_)
            | AgentError::AddressParsing(_)
            | AgentError::Json(_)
            | AgentError::Io(_)
            | AgentError::Cancelled
            | AgentError::Other(_) => Disposition::Fatal,
        }
    }

    /// Attach the command id to a failure inside the pipeline
    pub fn for_command(self, cmd_id: impl std::fmt::Display) -> Self {
        AgentError::Command {
            cmd_id: cmd_id.to_string(),
            source: Box::new(self),
        }
    }

    pub(crate) fn malformed(event: &str, reason: impl Into<String>) -> Self {
        AgentError::MalformedEvent {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_and_submission_are_retried() {
        assert_eq!(
            AgentError::Transport("connection refused".into()).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            AgentError::Submission("nonce too low".into()).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            AgentError::RegistrationTimeout { timeout_secs: 30 }.disposition(),
            Disposition::Retry
        );
    }

    #[test]
    fn test_startup_errors_are_fatal() {
        assert_eq!(
            AgentError::NodeStartup("no rpc".into()).disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            AgentError::FilterCreation {
                event: "CommandPending".into(),
                reason: "unknown event".into(),
            }
            .disposition(),
            Disposition::Fatal
        );
    }

    #[test]
    fn test_pipeline_errors_are_skipped() {
        assert_eq!(
            AgentError::Crypto("bad padding".into()).disposition(),
            Disposition::Skip
        );
        assert_eq!(Disposition::Skip.to_string(), "skip");
    }

    #[test]
    fn test_command_failure_wraps_cause() {
        let err = AgentError::Crypto("bad padding".into()).for_command(7);
        assert_eq!(err.to_string(), "Command 7 failed: Crypto error: bad padding");
        assert_eq!(err.disposition(), Disposition::Skip);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_malformed_message() {
        let err = AgentError::malformed("CommandPending", "missing field cmdId");
        assert_eq!(
            err.to_string(),
            "Malformed CommandPending event: missing field cmdId"
        );
    }
}
