//! The scheduler: owns tasks, steps routines, routes dispatched events.
//!
//! # Turns
//!
//! Everything happens on the caller's thread, in three kinds of turn:
//!
//! ```text
//! synchronous    run / fork / dispatch
//!                  new tasks are stepped to their first suspension
//!                  before the call returns
//!
//! resumption     drain()
//!                  tasks whose awaited value settled are resumed,
//!                  strictly in wake order, until the ready queue is empty
//!
//! reporting      flush_failures()
//!                  queued routine failures go to the FailureSink
//! ```
//!
//! [`Scheduler::advance`] alternates the last two until nothing is left.
//! A task is never resumed from inside a waker, so a settlement can never
//! re-enter a routine that is still running.
//!
//! # Stepping
//!
//! | Poll result          | Task becomes | Also                                |
//! |----------------------|--------------|-------------------------------------|
//! | `Pending`            | `Suspended`  | waits for its waker                 |
//! | `Ready(Ok(()))`      | `Done`       | owned subscriptions removed         |
//! | `Ready(Err(e))`      | `Failed`     | `e` queued on the failure reporter  |
//! | panic                | `Failed`     | [`SagaError::TaskPanicked`] queued  |
//!
//! A task whose cancellation was requested while it ran becomes `Cancelled`
//! instead of `Suspended` or `Failed`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::task::{waker, ArcWake};
use tracing::{debug, error, trace, warn};

use crate::config::{SchedulerBuilder, SchedulerConfig};
use crate::context::SagaContext;
use crate::core::{CorrelationId, Event, SubscriptionId, TaskId};
use crate::effect::{IntoSaga, Saga};
use crate::error::{panic_message, SagaError};
use crate::pattern::Matcher;
use crate::registry::{OnMatch, SubscriptionRegistry};
use crate::reporter::{FailureReporter, FailureSink, TaskFailure};
use crate::task::{Routine, SagaFuture, Start, Task, TaskHandle, TaskState, TaskStatus};

// ============================================================================
// Ready queue
// ============================================================================

#[derive(Debug, Default)]
struct ReadyState {
    queue: VecDeque<TaskId>,
    queued: HashSet<TaskId>,
}

/// FIFO of tasks waiting to be resumed. A task is queued at most once.
///
/// Behind a mutex because wakers must be `Send + Sync`, even though only
/// the scheduler's thread ever pops.
#[derive(Debug, Default)]
struct ReadyQueue {
    state: Mutex<ReadyState>,
}

impl ReadyQueue {
    fn lock(&self) -> MutexGuard<'_, ReadyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, id: TaskId) {
        let mut state = self.lock();
        if state.queued.insert(id) {
            state.queue.push_back(id);
        }
    }

    fn pop(&self) -> Option<TaskId> {
        let mut state = self.lock();
        let id = state.queue.pop_front()?;
        state.queued.remove(&id);
        Some(id)
    }

    fn remove(&self, id: TaskId) {
        let mut state = self.lock();
        if state.queued.remove(&id) {
            state.queue.retain(|queued| *queued != id);
        }
    }

    fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.push(arc_self.id);
    }
}

// ============================================================================
// Core
// ============================================================================

enum Outcome {
    Done,
    Failed(anyhow::Error),
    Cancelled,
}

impl Outcome {
    fn state(&self) -> TaskState {
        match self {
            Outcome::Done => TaskState::Done,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }
}

struct ResetOnDrop<'a>(&'a Cell<bool>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Puts the enclosing dispatch's correlation id back, even on unwind.
struct RestoreCid<'a>(&'a Cell<CorrelationId>, CorrelationId);

impl Drop for RestoreCid<'_> {
    fn drop(&mut self) {
        self.0.set(self.1);
    }
}

/// Shared scheduler state. Contexts, handles and subscriptions hold it
/// weakly; only [`Scheduler`] owns it.
pub(crate) struct Core<E: Event> {
    config: SchedulerConfig,
    registry: RefCell<SubscriptionRegistry<E>>,
    tasks: RefCell<HashMap<TaskId, Task<E>>>,
    ready: Arc<ReadyQueue>,
    reporter: RefCell<FailureReporter>,
    sink: Box<dyn FailureSink>,
    next_task: Cell<u64>,
    /// Depth of nested steps currently on the stack.
    stepping: Cell<usize>,
    draining: Cell<bool>,
    /// Correlation ID of the innermost dispatch in progress.
    dispatch_cid: Cell<CorrelationId>,
}

impl<E: Event> Core<E> {
    fn new(config: SchedulerConfig, sink: Box<dyn FailureSink>) -> Self {
        let registry = SubscriptionRegistry::new().with_panic_containment(config.catch_panics);
        Self {
            config,
            registry: RefCell::new(registry),
            tasks: RefCell::new(HashMap::new()),
            ready: Arc::new(ReadyQueue::default()),
            reporter: RefCell::new(FailureReporter::new()),
            sink,
            next_task: Cell::new(1),
            stepping: Cell::new(0),
            draining: Cell::new(false),
            dispatch_cid: Cell::new(CorrelationId::NONE),
        }
    }

    fn next_task_id(&self) -> TaskId {
        let n = self.next_task.get();
        self.next_task.set(n + 1);
        TaskId(n)
    }

    pub(crate) fn dispatch_cid(&self) -> CorrelationId {
        self.dispatch_cid.get()
    }

    pub(crate) fn subscribe(
        &self,
        matcher: Matcher<E>,
        on_match: OnMatch<E>,
        owner: TaskId,
    ) -> SubscriptionId {
        self.registry
            .borrow_mut()
            .subscribe(matcher, on_match, Some(owner))
    }

    pub(crate) fn launch(
        self: &Rc<Self>,
        saga: Saga<E>,
        parent: Option<TaskId>,
        cid: CorrelationId,
    ) -> Result<TaskHandle<E>, SagaError> {
        match saga {
            Saga::Effect(effect) => effect.perform(self, parent, cid),
            Saga::Routine { name, start } => Ok(self.spawn(Rc::from(name), parent, cid, start)),
        }
    }

    /// Create a task and step it to its first suspension.
    pub(crate) fn spawn(
        self: &Rc<Self>,
        name: Rc<str>,
        parent: Option<TaskId>,
        cid: CorrelationId,
        start: Start<E>,
    ) -> TaskHandle<E> {
        let id = self.next_task_id();
        let status = Rc::new(TaskStatus::new(id, name, cid));

        let parent = {
            let mut tasks = self.tasks.borrow_mut();
            let parent = parent.filter(|p| match tasks.get_mut(p) {
                Some(task) => {
                    task.children.push(id);
                    true
                }
                None => false,
            });
            tasks.insert(id, Task::new(status.clone(), parent, start));
            parent
        };

        debug!(
            task = %id,
            name = %status.name(),
            parent = ?parent,
            correlation_id = %cid,
            "task forked"
        );

        self.step(id);
        TaskHandle::new(status, Rc::downgrade(self))
    }

    /// Poll a task once. Returns false if there was nothing to step.
    fn step(self: &Rc<Self>, id: TaskId) -> bool {
        let taken = {
            let mut tasks = self.tasks.borrow_mut();
            tasks
                .get_mut(&id)
                .and_then(|task| task.routine.take().map(|r| (task.status.clone(), r)))
        };
        let Some((status, routine)) = taken else {
            trace!(task = %id, "stale resumption skipped");
            return false;
        };

        if status.cancel_requested() {
            drop(routine);
            self.finish(id, Outcome::Cancelled);
            return true;
        }

        if let Err(e) = status.transition(TaskState::Running) {
            error!(error = %e, "task cannot be stepped");
            self.put_back(id, routine);
            return false;
        }
        trace!(task = %id, "stepping");

        let waker = waker(Arc::new(TaskWaker {
            id,
            ready: self.ready.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        let context = SagaContext::new(Rc::downgrade(self), status.clone());

        self.stepping.set(self.stepping.get() + 1);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut future: SagaFuture = match routine {
                Routine::Start(start) => start(context),
                Routine::Polling(future) => future,
            };
            let poll = future.as_mut().poll(&mut cx);
            (future, poll)
        }));
        self.stepping.set(self.stepping.get() - 1);

        match result {
            Ok((_, Poll::Ready(Ok(())))) => self.finish(id, Outcome::Done),
            Ok((_, Poll::Ready(Err(error)))) => self.finish(id, Outcome::Failed(error)),
            Ok((future, Poll::Pending)) => {
                if status.cancel_requested() {
                    drop(future);
                    self.finish(id, Outcome::Cancelled);
                } else {
                    if let Err(e) = status.transition(TaskState::Suspended) {
                        error!(error = %e, "task cannot be suspended");
                    }
                    self.put_back(id, Routine::Polling(future));
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task = %id, panic = %message, "routine panicked");
                self.finish(
                    id,
                    Outcome::Failed(SagaError::TaskPanicked { task: id, message }.into()),
                );
                if !self.config.catch_panics {
                    panic::resume_unwind(payload);
                }
            }
        }
        true
    }

    fn put_back(&self, id: TaskId, routine: Routine<E>) {
        if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
            task.routine = Some(routine);
        }
    }

    /// Move a task to its terminal state and destroy it.
    fn finish(self: &Rc<Self>, id: TaskId, outcome: Outcome) {
        let task = self.tasks.borrow_mut().remove(&id);
        let Some(task) = task else {
            return;
        };

        let outcome = match outcome {
            Outcome::Failed(error) if task.status.cancel_requested() => {
                debug!(task = %id, error = %error, "failure suppressed by cancellation");
                Outcome::Cancelled
            }
            other => other,
        };

        if let Err(e) = task.status.transition(outcome.state()) {
            error!(error = %e, "task finished from an unexpected state");
        }
        self.ready.remove(id);
        let released = self.registry.borrow_mut().unsubscribe_owned(id);

        if let Some(parent) = task.parent {
            if let Some(parent) = self.tasks.borrow_mut().get_mut(&parent) {
                parent.children.retain(|child| *child != id);
            }
        }

        match outcome {
            Outcome::Done => {
                debug!(task = %id, subscriptions_released = released, "task done");
            }
            Outcome::Failed(error) => {
                debug!(task = %id, error = %error, "task failed");
                self.reporter.borrow_mut().report(TaskFailure::new(
                    id,
                    task.status.name().to_string(),
                    task.status.cid(),
                    error,
                ));
            }
            Outcome::Cancelled => {
                debug!(
                    task = %id,
                    subscriptions_released = released,
                    children = task.children.len(),
                    "task cancelled"
                );
                for child in &task.children {
                    self.cancel(*child);
                }
            }
        }
    }

    /// Cancel a task. Parked tasks stop now; a running task stops when its
    /// current step returns.
    pub(crate) fn cancel(self: &Rc<Self>, id: TaskId) {
        let parked = {
            let tasks = self.tasks.borrow();
            let Some(task) = tasks.get(&id) else {
                return;
            };
            if task.status.cancel_requested() {
                return;
            }
            task.status.request_cancel();
            task.routine.is_some()
        };
        debug!(task = %id, parked, "cancel requested");
        if parked {
            self.finish(id, Outcome::Cancelled);
        }
    }

    pub(crate) fn dispatch(self: &Rc<Self>, event: E) -> usize {
        let cid = CorrelationId::new();
        let previous = self.dispatch_cid.replace(cid);
        trace!(kind = ?event.kind(), correlation_id = %cid, "dispatching");

        let outcome = {
            let _restore = RestoreCid(&self.dispatch_cid, previous);
            SubscriptionRegistry::notify(&self.registry, &event)
        };

        for panicked in outcome.panicked {
            let Some(owner) = panicked.owner else {
                continue;
            };
            let name = self
                .tasks
                .borrow()
                .get(&owner)
                .map(|task| task.status.name().to_string())
                .unwrap_or_default();
            self.reporter.borrow_mut().report(TaskFailure::new(
                owner,
                name,
                cid,
                SagaError::SubscriptionPanicked {
                    subscription: panicked.id,
                    message: panicked.message,
                }
                .into(),
            ));
        }

        debug!(
            kind = ?event.kind(),
            correlation_id = %cid,
            tested = outcome.tested,
            matched = outcome.matched,
            "dispatched"
        );
        outcome.matched
    }

    fn drain(self: &Rc<Self>) -> Result<usize, SagaError> {
        if self.stepping.get() > 0 || self.draining.get() {
            return Err(SagaError::ReentrantDrain);
        }
        self.draining.set(true);
        let _reset = ResetOnDrop(&self.draining);

        let budget = self.config.drain_budget;
        let mut resumed = 0;
        loop {
            if resumed >= budget && self.ready.len() > 0 {
                warn!(resumed, remaining = self.ready.len(), "drain budget exhausted");
                return Err(SagaError::DrainBudgetExhausted { steps: resumed });
            }
            let Some(id) = self.ready.pop() else {
                break;
            };
            if self.step(id) {
                resumed += 1;
            }
        }

        if resumed > 0 {
            debug!(resumed, "drained");
        }
        Ok(resumed)
    }

    /// Hand queued failures to the sink one at a time. If the sink panics,
    /// the failures behind the one it was handling stay queued.
    fn flush_failures(&self) -> usize {
        let mut count = 0;
        loop {
            let Some(failure) = self.reporter.borrow_mut().pop() else {
                break;
            };
            count += 1;
            self.sink.on_failure(failure);
        }
        if count > 0 {
            debug!(count, "failures reported");
        }
        count
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// What one [`Scheduler::advance`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Turn {
    /// Tasks resumed.
    pub resumed: usize,
    /// Failures handed to the sink.
    pub reported: usize,
}

impl Turn {
    /// Check if nothing happened.
    pub fn is_empty(&self) -> bool {
        self.resumed == 0 && self.reported == 0
    }
}

/// Single-threaded saga scheduler.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::<Action>::new();
///
/// scheduler.run(take_every(Pattern::exact(FETCH), |cx, action| async move {
///     let user = api.fetch(action.id).await?;
///     cx.dispatch(Action::loaded(user))?;
///     Ok(())
/// }))?;
///
/// scheduler.dispatch(Action::fetch(7));   // worker forked and started
/// scheduler.advance()?;                   // resumed, failures reported
/// ```
pub struct Scheduler<E: Event> {
    core: Rc<Core<E>>,
}

impl<E: Event> Scheduler<E> {
    /// Create a scheduler with the default configuration and a
    /// [`TracingSink`](crate::TracingSink).
    pub fn new() -> Self {
        SchedulerBuilder::new().build()
    }

    /// Create a builder.
    pub fn builder() -> SchedulerBuilder<E> {
        SchedulerBuilder::new()
    }

    pub(crate) fn from_parts(config: SchedulerConfig, sink: Box<dyn FailureSink>) -> Self {
        Self {
            core: Rc::new(Core::new(config, sink)),
        }
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Start a root saga: perform an effect, or run a routine as a new task.
    ///
    /// A routine runs synchronously up to its first suspension before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::EmptyPattern`] for an effect whose pattern can
    /// never match. Nothing is created in that case.
    pub fn run<S>(&self, saga: S) -> Result<TaskHandle<E>, SagaError>
    where
        S: IntoSaga<E>,
    {
        self.core
            .launch(saga.into_saga(), None, CorrelationId::NONE)
    }

    /// Dispatch an event to every live subscription.
    ///
    /// Matching workers are forked and stepped to their first suspension
    /// before this returns; a worker that dispatches again has that nested
    /// dispatch finish first. Returns how many subscriptions matched.
    pub fn dispatch(&self, event: E) -> usize {
        self.core.dispatch(event)
    }

    /// Resume every task whose awaited value has settled, in wake order,
    /// until none are left. Returns how many resumptions ran.
    ///
    /// # Errors
    ///
    /// - [`SagaError::ReentrantDrain`] when called from inside a routine.
    /// - [`SagaError::DrainBudgetExhausted`] when the queue keeps refilling
    ///   past the configured budget.
    pub fn drain(&self) -> Result<usize, SagaError> {
        self.core.drain()
    }

    /// Hand every queued failure to the sink, oldest first. Returns how many
    /// were reported.
    pub fn flush_failures(&self) -> usize {
        self.core.flush_failures()
    }

    /// Run resumption and reporting turns until both are quiet.
    pub fn advance(&self) -> Result<Turn, SagaError> {
        let mut turn = Turn::default();
        loop {
            let resumed = self.drain()?;
            let reported = self.flush_failures();
            turn.resumed += resumed;
            turn.reported += reported;
            if resumed == 0 && reported == 0 {
                break;
            }
        }
        Ok(turn)
    }

    /// Number of live tasks, watchers included.
    pub fn task_count(&self) -> usize {
        self.core.tasks.borrow().len()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// Number of tasks waiting for the next `drain`.
    pub fn pending_resumptions(&self) -> usize {
        self.core.ready.len()
    }

    /// Number of failures waiting for the next `flush_failures`.
    pub fn pending_failures(&self) -> usize {
        self.core.reporter.borrow().len()
    }

    /// Check if there is nothing left to resume or report.
    pub fn is_idle(&self) -> bool {
        self.pending_resumptions() == 0 && self.pending_failures() == 0
    }
}

impl<E: Event> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.task_count())
            .field("subscriptions", &self.subscription_count())
            .field("pending_resumptions", &self.pending_resumptions())
            .field("pending_failures", &self.pending_failures())
            .finish()
    }
}
