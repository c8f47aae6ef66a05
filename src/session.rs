//! Session state of the agent
//!
//! One instance per process, owned by the agent and passed by reference.
//! Once Registered it stays Registered; a new session needs a new process.

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
    /// Retry budget exhausted or a fatal error; terminal
    Failed,
}

impl RegistrationStatus {
    pub fn can_transition_to(self, target: RegistrationStatus) -> bool {
        use RegistrationStatus::*;
        matches!(
            (self, target),
            (Unregistered, Registering)
                | (Unregistered, Failed)
                | (Registering, Registered)
                | (Registering, Unregistered)
                | (Registering, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RegistrationStatus::Registered | RegistrationStatus::Failed)
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationStatus::Unregistered => write!(f, "unregistered"),
            RegistrationStatus::Registering => write!(f, "registering"),
            RegistrationStatus::Registered => write!(f, "registered"),
            RegistrationStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    status: RegistrationStatus,
    session_id: Option<B256>,
    last_error: Option<String>,
    attempts: u32,
    /// Block holding the registration confirmation
    confirmed_block: Option<u64>,
    registered_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: RegistrationStatus::Unregistered,
            session_id: None,
            last_error: None,
            attempts: 0,
            confirmed_block: None,
            registered_at: None,
        }
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<B256> {
        self.session_id
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Registration attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Block the confirmation was mined in, when the node reported one
    pub fn confirmed_block(&self) -> Option<u64> {
        self.confirmed_block
    }

    pub fn is_registered(&self) -> bool {
        self.status == RegistrationStatus::Registered
    }

    /// Session id, only when Registered
    pub fn registered_session(&self) -> Option<B256> {
        if self.is_registered() {
            self.session_id
        } else {
            None
        }
    }

    fn transition(&mut self, to: RegistrationStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(AgentError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn begin_registration(&mut self) -> Result<()> {
        self.transition(RegistrationStatus::Registering)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn confirm(&mut self, session_id: B256, block: Option<u64>) -> Result<()> {
        self.transition(RegistrationStatus::Registered)?;
        self.session_id = Some(session_id);
        self.confirmed_block = block;
        self.last_error = None;
        self.registered_at = Some(Utc::now());
        Ok(())
    }

    /// A failed attempt: back to Unregistered so the caller can retry
    pub fn abandon_attempt(&mut self, error: &AgentError) -> Result<()> {
        self.transition(RegistrationStatus::Unregistered)?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    pub fn fail(&mut self, error: &AgentError) -> Result<()> {
        self.transition(RegistrationStatus::Failed)?;
        self.last_error = Some(error.to_string());
        Ok(())
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
