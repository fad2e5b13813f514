//! Event subscription registry.
//!
//! Maps live pattern subscriptions to their `on_match` callbacks. The store
//! adapter notifies the registry synchronously on every dispatch.
//!
//! # Notification pass
//!
//! ```text
//! notify(event)
//!   snapshot [sub#1, sub#2, sub#3]     (taken before any callback runs)
//!     sub#1 matches?  ─► on_match(event)   runs to completion, may fork,
//!     sub#2 live?     ─► skipped if removed by sub#1
//!     sub#3 matches?  ─► on_match(event)
//!   subscriptions added during the pass wait for the next dispatch
//! ```
//!
//! No borrow of the registry is held while a callback runs, so callbacks may
//! subscribe, unsubscribe or dispatch again.
//!
//! # Isolation
//!
//! A panic in one subscription's pattern or callback is caught and reported
//! in [`NotifyOutcome::panicked`]; the rest of the pass still runs. One bad
//! subscription must not starve its siblings. With containment turned off
//! ([`SubscriptionRegistry::with_panic_containment`]) the panic unwinds out
//! of `notify` instead.

use std::cell::{Cell, RefCell};
use std::panic::{self, catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{trace, warn};

use crate::core::{SubscriptionId, TaskId};
use crate::error::panic_message;
use crate::pattern::Matcher;

/// Callback invoked with each matching event.
pub type OnMatch<E> = Rc<dyn Fn(&E)>;

struct Subscription<E> {
    id: SubscriptionId,
    matcher: Matcher<E>,
    on_match: OnMatch<E>,
    owner: Option<TaskId>,
    live: Rc<Cell<bool>>,
}

/// Result of one notification pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Subscriptions whose pattern was tested.
    pub tested: usize,
    /// Subscriptions whose callback ran.
    pub matched: usize,
    /// Subscriptions that panicked.
    pub panicked: Vec<PanickedSubscription>,
}

/// A subscription whose pattern or callback panicked during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanickedSubscription {
    pub id: SubscriptionId,
    pub owner: Option<TaskId>,
    pub message: String,
}

/// Registry of pattern subscriptions, in registration order.
pub struct SubscriptionRegistry<E> {
    subscriptions: Vec<Subscription<E>>,
    next_id: u64,
    contain_panics: bool,
}

impl<E: 'static> SubscriptionRegistry<E> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            next_id: 1,
            contain_panics: true,
        }
    }

    /// Choose whether a panicking pattern or callback is caught and reported
    /// (the default) or unwinds out of [`notify`](Self::notify).
    pub fn with_panic_containment(mut self, contain: bool) -> Self {
        self.contain_panics = contain;
        self
    }

    /// Register a subscription. It is eligible from the next notification
    /// pass on, never the one in progress.
    pub fn subscribe(
        &mut self,
        matcher: Matcher<E>,
        on_match: OnMatch<E>,
        owner: Option<TaskId>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        trace!(subscription = %id, pattern = matcher.label(), "subscribed");
        self.subscriptions.push(Subscription {
            id,
            matcher,
            on_match,
            owner,
            live: Rc::new(Cell::new(true)),
        });
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(pos) = self.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        let removed = self.subscriptions.remove(pos);
        removed.live.set(false);
        trace!(subscription = %id, "unsubscribed");
        true
    }

    /// Remove every subscription owned by `owner`. Returns how many were removed.
    pub fn unsubscribe_owned(&mut self, owner: TaskId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| {
            let keep = s.owner != Some(owner);
            if !keep {
                s.live.set(false);
            }
            keep
        });
        before - self.subscriptions.len()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check if no subscriptions are registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Test `event` against every live subscription and run the callbacks of
    /// those that match, strictly one after another.
    ///
    /// Takes the registry by `RefCell` because callbacks may re-enter it.
    pub fn notify(registry: &RefCell<Self>, event: &E) -> NotifyOutcome {
        let contain = registry.borrow().contain_panics;
        let snapshot: Vec<_> = registry
            .borrow()
            .subscriptions
            .iter()
            .map(|s| {
                (
                    s.id,
                    s.owner,
                    s.matcher.clone(),
                    s.on_match.clone(),
                    s.live.clone(),
                )
            })
            .collect();

        let mut outcome = NotifyOutcome::default();
        for (id, owner, matcher, on_match, live) in snapshot {
            if !live.get() {
                continue;
            }
            outcome.tested += 1;

            let result = catch_unwind(AssertUnwindSafe(|| {
                if matcher.matches(event) {
                    on_match(event);
                    true
                } else {
                    false
                }
            }));

            match result {
                Ok(true) => outcome.matched += 1,
                Ok(false) => {}
                Err(payload) => {
                    if !contain {
                        panic::resume_unwind(payload);
                    }
                    let message = panic_message(payload.as_ref());
                    warn!(subscription = %id, panic = %message, "subscription panicked during notify");
                    outcome.panicked.push(PanickedSubscription { id, owner, message });
                }
            }
        }
        outcome
    }
}

impl<E: 'static> Default for SubscriptionRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for SubscriptionRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscription_count", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Event;
    use crate::pattern::Pattern;

    #[derive(Debug, Clone, PartialEq)]
    struct TestEvent {
        kind: u32,
    }

    impl Event for TestEvent {
        type Kind = u32;

        fn kind(&self) -> u32 {
            self.kind
        }
    }

    type Log = Rc<RefCell<Vec<String>>>;

    fn recorder(log: &Log, label: &'static str) -> OnMatch<TestEvent> {
        let log = log.clone();
        Rc::new(move |e: &TestEvent| log.borrow_mut().push(format!("{}:{}", label, e.kind)))
    }

    fn exact(kind: u32) -> Matcher<TestEvent> {
        Pattern::exact(kind).compile().unwrap()
    }

    #[test]
    fn test_notify_runs_matches_in_registration_order() {
        let log: Log = Rc::default();
        let registry = RefCell::new(SubscriptionRegistry::new());
        registry.borrow_mut().subscribe(exact(1), recorder(&log, "a"), None);
        registry.borrow_mut().subscribe(exact(2), recorder(&log, "b"), None);
        registry
            .borrow_mut()
            .subscribe(Pattern::any().compile().unwrap(), recorder(&log, "c"), None);

        let outcome = SubscriptionRegistry::notify(&registry, &TestEvent { kind: 1 });

        assert_eq!(outcome.tested, 3);
        assert_eq!(outcome.matched, 2);
        assert_eq!(*log.borrow(), vec!["a:1", "c:1"]);
    }

    #[test]
    fn test_subscription_added_during_notify_waits_for_next_pass() {
        let log: Log = Rc::default();
        let registry = Rc::new(RefCell::new(SubscriptionRegistry::new()));

        let inner_registry = registry.clone();
        let inner_log = log.clone();
        let subscribe_more: OnMatch<TestEvent> = Rc::new(move |_e: &TestEvent| {
            inner_registry
                .borrow_mut()
                .subscribe(exact(1), recorder(&inner_log, "late"), None);
        });
        registry.borrow_mut().subscribe(exact(1), subscribe_more, None);

        SubscriptionRegistry::notify(&registry, &TestEvent { kind: 1 });
        assert!(log.borrow().is_empty());

        SubscriptionRegistry::notify(&registry, &TestEvent { kind: 1 });
        assert_eq!(*log.borrow(), vec!["late:1"]);
    }

    #[test]
    fn test_unsubscribe_during_notify_skips_removed_subscription() {
        let log: Log = Rc::default();
        let registry = Rc::new(RefCell::new(SubscriptionRegistry::new()));

        // sub#1 removes sub#2 before sub#2 is tested
        let inner_registry = registry.clone();
        let remover: OnMatch<TestEvent> = Rc::new(move |_e: &TestEvent| {
            inner_registry.borrow_mut().unsubscribe(SubscriptionId(2));
        });
        registry.borrow_mut().subscribe(exact(1), remover, None);
        registry.borrow_mut().subscribe(exact(1), recorder(&log, "victim"), None);
        registry.borrow_mut().subscribe(exact(1), recorder(&log, "after"), None);

        let outcome = SubscriptionRegistry::notify(&registry, &TestEvent { kind: 1 });

        assert_eq!(outcome.tested, 2);
        assert_eq!(*log.borrow(), vec!["after:1"]);
        assert_eq!(registry.borrow().len(), 2);
    }

    #[test]
    fn test_panicking_callback_does_not_starve_siblings() {
        let log: Log = Rc::default();
        let registry = RefCell::new(SubscriptionRegistry::new());
        let boom: OnMatch<TestEvent> = Rc::new(|_e: &TestEvent| panic!("callback exploded"));
        let boom_id = registry.borrow_mut().subscribe(exact(1), boom, None);
        registry.borrow_mut().subscribe(exact(1), recorder(&log, "ok"), None);

        let outcome = SubscriptionRegistry::notify(&registry, &TestEvent { kind: 1 });

        assert_eq!(*log.borrow(), vec!["ok:1"]);
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.panicked.len(), 1);
        assert_eq!(outcome.panicked[0].id, boom_id);
        assert!(outcome.panicked[0].message.contains("exploded"));
    }

    #[test]
    fn test_uncontained_panic_unwinds_out_of_notify() {
        let log: Log = Rc::default();
        let registry = RefCell::new(SubscriptionRegistry::new().with_panic_containment(false));
        let boom: OnMatch<TestEvent> = Rc::new(|_e: &TestEvent| panic!("callback exploded"));
        registry.borrow_mut().subscribe(exact(1), boom, None);
        registry.borrow_mut().subscribe(exact(1), recorder(&log, "ok"), None);

        let result = catch_unwind(AssertUnwindSafe(|| {
            SubscriptionRegistry::notify(&registry, &TestEvent { kind: 1 })
        }));

        assert!(result.is_err());
        assert!(log.borrow().is_empty());
        // nothing stays borrowed after the unwind
        assert_eq!(registry.borrow().len(), 2);
    }

    #[test]
    fn test_unsubscribe_owned() {
        let log: Log = Rc::default();
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(exact(1), recorder(&log, "a"), Some(TaskId(1)));
        registry.subscribe(exact(1), recorder(&log, "b"), Some(TaskId(2)));
        registry.subscribe(exact(2), recorder(&log, "c"), Some(TaskId(1)));

        assert_eq!(registry.unsubscribe_owned(TaskId(1)), 2);
        assert_eq!(registry.len(), 1);
        assert!(!registry.unsubscribe(SubscriptionId(1)));
        assert!(registry.unsubscribe(SubscriptionId(2)));
        assert!(registry.is_empty());
    }
}
