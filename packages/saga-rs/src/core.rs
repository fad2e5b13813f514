//! Core traits and identifiers for the saga scheduler.
//!
//! # Overview
//!
//! Everything that flows through the scheduler is an [`Event`]: an immutable
//! fact dispatched by the host store. Patterns match on the event's
//! discriminant ([`Event::kind`]), so an event type only has to say what kind
//! of thing it is.
//!
//! Tasks and subscriptions are tracked by small `Copy` ids. Each dispatch
//! gets a [`CorrelationId`] that is inherited by every task it forks, which
//! lets a failure report point back at the dispatch that caused it.

use std::fmt;

use uuid::Uuid;

/// An application-defined event dispatched through the store.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct Action {
///     kind: u32,
///     extra: bool,
/// }
///
/// impl Event for Action {
///     type Kind = u32;
///
///     fn kind(&self) -> u32 {
///         self.kind
///     }
/// }
/// ```
pub trait Event: Clone + 'static {
    /// The discriminant patterns compare against.
    type Kind: Clone + PartialEq + fmt::Debug + 'static;

    /// Returns this event's discriminant.
    fn kind(&self) -> Self::Kind;
}

/// Unique identifier for a task, allocated by the scheduler that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Unique identifier for a registry subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Correlation ID tying forked tasks back to the dispatch that started them.
///
/// Tasks started with [`Scheduler::run`](crate::Scheduler::run) carry
/// `CorrelationId::NONE` unless they were forked from inside a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for work not caused by a dispatch.
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_none() {
        assert!(CorrelationId::NONE.is_none());
        assert!(!CorrelationId::NONE.is_some());
        assert!(CorrelationId::new().is_some());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(TaskId(7).to_string(), "task#7");
        assert_eq!(SubscriptionId(3).to_string(), "sub#3");
        assert_eq!(TaskId(7).raw(), 7);
    }
}
