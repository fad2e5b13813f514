//! # Saga
//!
//! A deterministic, single-threaded saga scheduler: long-running routines
//! suspend on awaited values, dispatched events fork workers.
//!
//! ## Core Concepts
//!
//! - [`Event`] = Facts dispatched through the store
//! - Routine = an `async` block run as a [`TaskHandle`]d task
//! - [`Effect`] = Inert description of work (`take_every`) for the scheduler
//!
//! ## Architecture
//!
//! ```text
//! Store
//!     │
//!     ▼ dispatch(event)
//! SubscriptionRegistry ──────────────────────────┐
//!     │                                          │
//!     ├─► take_every(A) matches ─► fork worker ──┤
//!     │                               │          │
//!     │                               ▼          │
//!     │                        step to first     │
//!     │                        suspension        │
//!     │                               │          │
//!     │                               └─► cx.dispatch()
//!     │
//!     └─► take_every(B) no match
//!
//! Deferred settles ─► waker ─► ready queue ─► drain() ─► resume task
//!
//! Task fails ─► FailureReporter ─► flush_failures() ─► FailureSink
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Synchronous forking** - A worker runs up to its first suspension
//!    inside the dispatch that matched it
//! 2. **Deferred resumption** - A settled value is observed only on the next
//!    `drain`, never re-entrantly
//! 3. **Isolated failures** - A failing routine never throws into `dispatch`;
//!    its error reaches the sink once, on a later turn, untouched
//! 4. **Sequential delivery** - Matching subscriptions run one after another,
//!    in registration order
//!
//! ## Example
//!
//! ```ignore
//! use saga::{take_every_with, Event, FailureLog, Pattern, Scheduler};
//!
//! #[derive(Debug, Clone)]
//! struct Action {
//!     kind: u32,
//! }
//!
//! impl Event for Action {
//!     type Kind = u32;
//!
//!     fn kind(&self) -> u32 {
//!         self.kind
//!     }
//! }
//!
//! let failures = FailureLog::new();
//! let scheduler = Scheduler::<Action>::builder()
//!     .with_failure_sink(failures.clone())
//!     .build();
//!
//! scheduler.run(take_every_with(
//!     Pattern::exact(1),
//!     |_cx, action, (a, b): (u32, u32)| async move {
//!         println!("{:?} with {} {}", action, a, b);
//!         Ok(())
//!     },
//!     (2, 3),
//! ))?;
//!
//! scheduler.dispatch(Action { kind: 1 });
//! scheduler.advance()?;
//! ```

mod config;
mod context;
mod core;
mod deferred;
mod effect;
mod error;
mod pattern;
mod registry;
mod reporter;
mod scheduler;
mod task;


pub use crate::core::{CorrelationId, Event, SubscriptionId, TaskId};

pub use crate::config::{SchedulerBuilder, SchedulerConfig, DEFAULT_DRAIN_BUDGET};
pub use crate::context::SagaContext;
pub use crate::deferred::{deferred, Deferred, Resolver};
pub use crate::effect::{take_every, take_every_with, Effect, IntoSaga, Saga, TakeEvery};
pub use crate::error::SagaError;
pub use crate::pattern::{Matcher, Pattern};
pub use crate::registry::{NotifyOutcome, OnMatch, PanickedSubscription, SubscriptionRegistry};
pub use crate::reporter::{FailureLog, FailureSink, TaskFailure, TracingSink};
pub use crate::scheduler::{Scheduler, Turn};
pub use crate::task::{SagaFuture, Start, TaskHandle, TaskState};
