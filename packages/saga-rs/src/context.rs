//! The context a routine runs with.
//!
//! Every routine receives a [`SagaContext`] bound to its own task. Effects
//! performed and routines forked through it become children of that task,
//! so cancelling the task tears them down too.

use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::core::{CorrelationId, Event, TaskId};
use crate::effect::{take_every, take_every_with, Effect, IntoSaga};
use crate::error::SagaError;
use crate::pattern::Pattern;
use crate::scheduler::Core;
use crate::task::{TaskHandle, TaskStatus};

/// Handle a routine uses to talk to its scheduler.
///
/// Cheap to clone. Holds the scheduler weakly: once the scheduler is
/// dropped every operation returns [`SagaError::SchedulerDropped`].
pub struct SagaContext<E: Event> {
    core: Weak<Core<E>>,
    status: Rc<TaskStatus>,
}

impl<E: Event> SagaContext<E> {
    pub(crate) fn new(core: Weak<Core<E>>, status: Rc<TaskStatus>) -> Self {
        Self { core, status }
    }

    fn core(&self) -> Result<Rc<Core<E>>, SagaError> {
        self.core.upgrade().ok_or(SagaError::SchedulerDropped)
    }

    /// The task this context belongs to.
    pub fn task_id(&self) -> TaskId {
        self.status.id()
    }

    /// Correlation ID inherited from the dispatch that forked this task.
    pub fn correlation_id(&self) -> CorrelationId {
        self.status.cid()
    }

    /// Check if this task has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.status.cancel_requested()
    }

    /// Perform an effect as a child of this task.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::EmptyPattern`] for a pattern that can never match.
    pub fn perform(&self, effect: Effect<E>) -> Result<TaskHandle<E>, SagaError> {
        let core = self.core()?;
        effect.perform(&core, Some(self.task_id()), self.correlation_id())
    }

    /// Shorthand for `perform(take_every(pattern, worker))`.
    pub fn take_every<F, Fut>(&self, pattern: Pattern<E>, worker: F) -> Result<TaskHandle<E>, SagaError>
    where
        F: Fn(SagaContext<E>, E) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.perform(take_every(pattern, worker))
    }

    /// Shorthand for `perform(take_every_with(pattern, worker, args))`.
    pub fn take_every_with<A, F, Fut>(
        &self,
        pattern: Pattern<E>,
        worker: F,
        args: A,
    ) -> Result<TaskHandle<E>, SagaError>
    where
        A: Clone + 'static,
        F: Fn(SagaContext<E>, E, A) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.perform(take_every_with(pattern, worker, args))
    }

    /// Start a routine or effect as a child of this task.
    ///
    /// A forked routine is stepped immediately, up to its first suspension,
    /// before `fork` returns.
    pub fn fork<S>(&self, saga: S) -> Result<TaskHandle<E>, SagaError>
    where
        S: IntoSaga<E>,
    {
        let core = self.core()?;
        core.launch(saga.into_saga(), Some(self.task_id()), self.correlation_id())
    }

    /// Dispatch an event through the store.
    ///
    /// Workers forked by this dispatch run up to their first suspension
    /// before this returns. Returns how many subscriptions matched.
    pub fn dispatch(&self, event: E) -> Result<usize, SagaError> {
        let core = self.core()?;
        Ok(core.dispatch(event))
    }
}

impl<E: Event> Clone for SagaContext<E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            status: self.status.clone(),
        }
    }
}

impl<E: Event> fmt::Debug for SagaContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaContext")
            .field("task", &self.task_id())
            .field("correlation_id", &self.correlation_id())
            .finish()
    }
}
