//! Patterns: which dispatched events a subscription cares about.
//!
//! A [`Pattern`] is a closed set of match specifications. It is compiled once,
//! at subscription time, into a [`Matcher`]: a single boolean test that is
//! pure, stateless and reused for every dispatched event.
//!
//! | Pattern     | Matches                                        |
//! |-------------|------------------------------------------------|
//! | `Exact(k)`  | events whose [`Event::kind`] equals `k`        |
//! | `Any`       | every event (the `*` wildcard)                 |
//! | `OneOf(ks)` | events whose kind equals any of `ks`           |
//! | `Predicate` | events for which the function returns `true`   |

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::core::Event;
use crate::error::SagaError;

/// A match specification over events of type `E`.
pub enum Pattern<E: Event> {
    /// Match one discriminant exactly.
    Exact(E::Kind),
    /// Match every event.
    Any,
    /// Match any of the listed discriminants. Must not be empty.
    OneOf(SmallVec<[E::Kind; 4]>),
    /// Match whatever the predicate accepts.
    Predicate(Rc<dyn Fn(&E) -> bool>),
}

impl<E: Event> Pattern<E> {
    /// Match events of exactly this kind.
    pub fn exact(kind: E::Kind) -> Self {
        Pattern::Exact(kind)
    }

    /// Match every event.
    pub fn any() -> Self {
        Pattern::Any
    }

    /// Match events whose kind is one of `kinds`.
    ///
    /// An empty list is accepted here and rejected by [`Pattern::compile`].
    pub fn one_of<I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = E::Kind>,
    {
        Pattern::OneOf(kinds.into_iter().collect())
    }

    /// Match events accepted by `predicate`.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + 'static,
    {
        Pattern::Predicate(Rc::new(predicate))
    }

    /// Compile this pattern into a reusable boolean test.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::EmptyPattern`] for a `OneOf` with no kinds.
    pub fn compile(self) -> Result<Matcher<E>, SagaError> {
        let label = self.to_string();
        let test: Rc<dyn Fn(&E) -> bool> = match self {
            Pattern::Exact(kind) => Rc::new(move |event: &E| event.kind() == kind),
            Pattern::Any => Rc::new(|_: &E| true),
            Pattern::OneOf(kinds) => {
                if kinds.is_empty() {
                    return Err(SagaError::EmptyPattern);
                }
                Rc::new(move |event: &E| {
                    let kind = event.kind();
                    kinds.iter().any(|k| *k == kind)
                })
            }
            Pattern::Predicate(predicate) => predicate,
        };
        Ok(Matcher { test, label })
    }
}

impl<E: Event> Clone for Pattern<E> {
    fn clone(&self) -> Self {
        match self {
            Pattern::Exact(kind) => Pattern::Exact(kind.clone()),
            Pattern::Any => Pattern::Any,
            Pattern::OneOf(kinds) => Pattern::OneOf(kinds.clone()),
            Pattern::Predicate(predicate) => Pattern::Predicate(predicate.clone()),
        }
    }
}

impl<E: Event> fmt::Display for Pattern<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(kind) => write!(f, "{:?}", kind),
            Pattern::Any => write!(f, "*"),
            Pattern::OneOf(kinds) => write!(f, "one_of{:?}", kinds.as_slice()),
            Pattern::Predicate(_) => write!(f, "predicate"),
        }
    }
}

impl<E: Event> fmt::Debug for Pattern<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&format_args!("{}", self)).finish()
    }
}

/// A compiled pattern. Cheap to clone.
pub struct Matcher<E> {
    test: Rc<dyn Fn(&E) -> bool>,
    label: String,
}

impl<E> Matcher<E> {
    /// Test an event against this matcher.
    pub fn matches(&self, event: &E) -> bool {
        (self.test)(event)
    }

    /// Human-readable form of the pattern this was compiled from.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<E> Clone for Matcher<E> {
    fn clone(&self) -> Self {
        Self {
            test: self.test.clone(),
            label: self.label.clone(),
        }
    }
}

impl<E> fmt::Debug for Matcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("pattern", &self.label)
            .finish_non_exhaustive()
    }
}
