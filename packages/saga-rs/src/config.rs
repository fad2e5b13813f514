//! Scheduler configuration and builder.

use std::marker::PhantomData;

use crate::core::Event;
use crate::reporter::{FailureSink, TracingSink};
use crate::scheduler::Scheduler;

/// Default cap on resumptions per [`Scheduler::drain`] call.
pub const DEFAULT_DRAIN_BUDGET: usize = 100_000;

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Contain panics. When false, a panicking routine still fails and is
    /// reported, then the panic unwinds out of whichever call was stepping
    /// it, `dispatch` included. Pattern panics unwind out of `dispatch` too.
    pub catch_panics: bool,
    /// Maximum resumptions a single `drain` performs before it gives up
    /// with [`SagaError::DrainBudgetExhausted`](crate::SagaError::DrainBudgetExhausted).
    pub drain_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            drain_budget: DEFAULT_DRAIN_BUDGET,
        }
    }
}

/// Builder for [`Scheduler`].
///
/// # Example
///
/// ```ignore
/// let failures = FailureLog::new();
/// let scheduler = Scheduler::<Action>::builder()
///     .with_failure_sink(failures.clone())
///     .drain_budget(1_000)
///     .build();
/// ```
pub struct SchedulerBuilder<E> {
    config: SchedulerConfig,
    sink: Box<dyn FailureSink>,
    _event: PhantomData<fn(E)>,
}

impl<E: Event> SchedulerBuilder<E> {
    /// Start from the default configuration with a [`TracingSink`].
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            sink: Box::new(TracingSink),
            _event: PhantomData,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Route uncaught failures to `sink`.
    pub fn with_failure_sink<S>(mut self, sink: S) -> Self
    where
        S: FailureSink + 'static,
    {
        self.sink = Box::new(sink);
        self
    }

    /// Contain panics instead of unwinding out of the scheduler (default: true).
    pub fn catch_panics(mut self, catch: bool) -> Self {
        self.config.catch_panics = catch;
        self
    }

    /// Cap resumptions per `drain` call.
    pub fn drain_budget(mut self, budget: usize) -> Self {
        self.config.drain_budget = budget;
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> Scheduler<E> {
        Scheduler::from_parts(self.config, self.sink)
    }
}

impl<E: Event> Default for SchedulerBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for SchedulerBuilder<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
