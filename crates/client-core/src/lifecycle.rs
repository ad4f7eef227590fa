use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Client lifecycle phase.
///
/// Long-poll traffic is only emitted while `Streaming`; `Failed` covers the
/// backoff window between a failed poll and the next attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientPhase {
    Unauthenticated,
    Authenticating,
    Syncing,
    Streaming,
    Failed,
    Stopped,
}

/// Deterministic lifecycle transition guard.
#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    phase: ClientPhase,
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self {
            phase: ClientPhase::Unauthenticated,
        }
    }
}

impl LifecycleMachine {
    /// Current lifecycle phase.
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// A login or register attempt was started.
    pub fn begin_login(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(
            &[ClientPhase::Unauthenticated, ClientPhase::Stopped],
            ClientPhase::Authenticating,
            "login",
        )
    }

    /// The server refused the authentication attempt.
    pub fn auth_failed(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(
            &[ClientPhase::Authenticating],
            ClientPhase::Unauthenticated,
            "auth_failed",
        )
    }

    /// The initial snapshot request was issued.
    pub fn begin_sync(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(
            &[ClientPhase::Authenticating, ClientPhase::Stopped],
            ClientPhase::Syncing,
            "start",
        )
    }

    /// The initial snapshot has been fully folded; streaming begins.
    pub fn sync_ready(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(&[ClientPhase::Syncing], ClientPhase::Streaming, "sync_ready")
    }

    /// The initial snapshot request failed; a later `start` may retry.
    pub fn sync_failed(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(
            &[ClientPhase::Syncing],
            ClientPhase::Authenticating,
            "sync_failed",
        )
    }

    /// A long-poll failed; the pump is backing off.
    pub fn poll_failed(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(&[ClientPhase::Streaming], ClientPhase::Failed, "poll_failed")
    }

    /// A long-poll succeeded after one or more failures.
    pub fn poll_recovered(&mut self) -> Result<ClientPhase, ClientError> {
        self.transition_from_any_of(
            &[ClientPhase::Failed],
            ClientPhase::Streaming,
            "poll_recovered",
        )
    }

    /// The client was stopped. Errors only when already stopped.
    pub fn stop(&mut self) -> Result<ClientPhase, ClientError> {
        if self.phase == ClientPhase::Stopped {
            return Err(ClientError::invalid_phase(self.phase, "stop"));
        }
        self.phase = ClientPhase::Stopped;
        Ok(self.phase)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ClientPhase],
        next: ClientPhase,
        action: &str,
    ) -> Result<ClientPhase, ClientError> {
        if !expected.contains(&self.phase) {
            return Err(ClientError::invalid_phase(self.phase, action));
        }
        self.phase = next;
        Ok(next)
    }
}
