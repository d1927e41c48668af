//! Operation lifecycle state machine.
//!
//! `Created → Queued → Running → {Completed | Failed | Cancelled | TimedOut}`,
//! with `Running → Queued` permitted for retry and token-refresh requeues.
//! Terminal states are final; the single-transition guard in
//! [`Operation`](crate::Operation) relies on [`OperationState::can_transition`]
//! to ensure exactly one terminal notification fires per operation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`Operation`](crate::Operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Built but not yet handed to the engine.
    Created,
    /// Registered with the engine, awaiting admission (or a token).
    Queued,
    /// Submitted to the transport; an attempt is in flight.
    Running,
    /// Finished with a transport-successful, logically-successful response.
    Completed,
    /// Finished with an error (transport, HTTP status, logical, or auth).
    Failed,
    /// Cancelled by the caller before reaching another terminal state.
    Cancelled,
    /// The final attempt exceeded the per-attempt timeout.
    TimedOut,
}

impl OperationState {
    /// Whether this state is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        match (self, next) {
            (Self::Created, Self::Queued) => true,
            (Self::Queued, Self::Running) => true,
            // Retry and token-refresh requeues.
            (Self::Running, Self::Queued) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::TimedOut) => true,
            // A queued operation can fail without running (token-wait drain,
            // configuration errors surfaced at admission).
            (Self::Queued, Self::Failed) => true,
            // Cancellation is valid from any non-terminal state.
            (from, Self::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}
