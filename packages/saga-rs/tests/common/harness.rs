//! Test harness: a scheduler wired to a collecting failure sink, plus the
//! event type and recorders the integration tests share.

use std::cell::RefCell;
use std::rc::Rc;

use saga::{Event, FailureLog, Pattern, SagaContext, Scheduler};

/// Event type used by the integration tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: u32,
    pub extra: bool,
}

impl Event for Action {
    type Kind = u32;

    fn kind(&self) -> u32 {
        self.kind
    }
}

pub type Cx = SagaContext<Action>;

/// Action of the given kind.
pub fn action(kind: u32) -> Action {
    Action { kind, extra: false }
}

/// Pattern matching one kind of [`Action`].
pub fn on(kind: u32) -> Pattern<Action> {
    Pattern::exact(kind)
}

/// Shared, append-only log for routines to write into.
#[derive(Debug)]
pub struct Recorder<T> {
    inner: Rc<RefCell<Vec<T>>>,
}

impl<T> Recorder<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.inner.borrow_mut().push(value);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

impl<T: Clone> Recorder<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.borrow().clone()
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Scheduler plus the sink its failures land in.
pub struct Harness {
    pub scheduler: Scheduler<Action>,
    pub failures: FailureLog,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let failures = FailureLog::new();
        let scheduler = Scheduler::builder()
            .with_failure_sink(failures.clone())
            .build();
        Self {
            scheduler,
            failures,
        }
    }
}

/// Initialize tracing once, respecting RUST_LOG.
/// Run tests with: RUST_LOG=saga=trace cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
