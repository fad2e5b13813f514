//! Structured error type for the saga scheduler.
//!
//! `SagaError` provides pattern-matchable errors for the scheduler's own
//! failure modes. Routines themselves return `anyhow::Result<()>`: anyhow is
//! the transport for whatever a routine raises, and the original error value
//! reaches the failure sink untouched (downcast it there).
//!
//! # Propagation
//!
//! - Routine failures never come back as `Err` from `dispatch`; they are
//!   queued on the failure reporter and surfaced on a later turn.
//! - Pattern configuration errors ([`SagaError::EmptyPattern`]) are returned
//!   synchronously to whoever registered the pattern.
//!
//! # Example
//!
//! ```ignore
//! match scheduler.run(take_every(Pattern::one_of([]), worker)) {
//!     Ok(watcher) => println!("watching as {}", watcher.id()),
//!     Err(SagaError::EmptyPattern) => eprintln!("pattern matches nothing"),
//!     Err(e) => eprintln!("other saga error: {}", e),
//! }
//! ```

use thiserror::Error;

use crate::core::{SubscriptionId, TaskId};
use crate::task::TaskState;

/// Structured error type for saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A `OneOf` pattern was built from an empty set of kinds.
    #[error("pattern has no kinds to match")]
    EmptyPattern,

    /// A task was driven through a transition its lifecycle does not allow.
    #[error("illegal transition for {task}: {from} -> {to}")]
    IllegalTransition {
        /// The task being transitioned.
        task: TaskId,
        /// State before the transition.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },

    /// The resolver for an awaited value was dropped without settling it.
    #[error("deferred value abandoned: resolver dropped without settling")]
    DeferredAbandoned,

    /// A routine panicked while it was being stepped.
    #[error("{task} panicked: {message}")]
    TaskPanicked {
        /// The task that panicked.
        task: TaskId,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// A subscription's pattern or callback panicked during a dispatch.
    #[error("subscription {subscription} panicked: {message}")]
    SubscriptionPanicked {
        /// The subscription that panicked.
        subscription: SubscriptionId,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// A context or handle outlived the scheduler it belongs to.
    #[error("scheduler dropped")]
    SchedulerDropped,

    /// `drain` was called from inside a running task.
    #[error("drain called while a task is being stepped")]
    ReentrantDrain,

    /// `drain` hit its step budget with resumptions still queued.
    #[error("drain budget exhausted after {steps} resumptions")]
    DrainBudgetExhausted {
        /// Resumptions performed before giving up.
        steps: usize,
    },
}

impl SagaError {
    /// Returns true for errors caused by how the scheduler was configured or
    /// called, as opposed to something a routine did.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SagaError::EmptyPattern | SagaError::ReentrantDrain | SagaError::DrainBudgetExhausted { .. }
        )
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
