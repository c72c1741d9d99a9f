//! Swap state machine
//!
//! Tracks one attempt of the credential swap protocol.

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// State of a single swap attempt
///
/// # State Transitions
///
/// ```text
/// Idle → Creating → Validating → Committing → Revoking → Done
///          ↓            ↓            ↓           ↓
///          → → → → → Failed ← ← ← ← ← (requeued by the scheduler)
/// ```
///
/// `Creating` retries in place; every other failure ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    /// Not started
    Idle,
    /// Minting the replacement with the current credential's authority
    Creating,
    /// Proving the replacement works
    Validating,
    /// Persisting the replacement and switching live references to it
    Committing,
    /// Revoking the retired credential
    Revoking,
    /// Swap complete
    Done,
    /// Attempt abandoned
    Failed,
}

impl SwapState {
    /// Check if transition to the target state is valid
    #[must_use]
    pub fn can_transition_to(&self, target: SwapState) -> bool {
        use SwapState::*;

        matches!(
            (self, target),
            (Idle, Creating)
                | (Creating, Validating)
                | (Validating, Committing)
                | (Committing, Revoking)
                | (Revoking, Done)
                | (Creating | Validating | Committing | Revoking, Failed)
        )
    }

    /// Validate and perform state transition
    pub fn transition_to(&self, target: SwapState) -> BrokerResult<SwapState> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(BrokerError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapState::Done | SwapState::Failed)
    }

    /// Whether the replacement has become authoritative
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, SwapState::Revoking | SwapState::Done)
    }
}

impl std::fmt::Display for SwapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapState::Idle => write!(f, "idle"),
            SwapState::Creating => write!(f, "creating"),
            SwapState::Validating => write!(f, "validating"),
            SwapState::Committing => write!(f, "committing"),
            SwapState::Revoking => write!(f, "revoking"),
            SwapState::Done => write!(f, "done"),
            SwapState::Failed => write!(f, "failed"),
        }
    }
}
