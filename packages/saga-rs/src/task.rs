//! Tasks: one running instance of a routine.
//!
//! # Lifecycle
//!
//! ```text
//! Created ─► Running ─┬─► Suspended ─► Running ─► ...
//!                     ├─► Done
//!                     └─► Failed
//!
//! Created | Running | Suspended ─► Cancelled
//! ```
//!
//! `Done`, `Failed` and `Cancelled` are terminal and entered at most once.
//! The scheduler owns every [`Task`]; the outside world only ever sees a
//! [`TaskHandle`], which keeps observing the final state after the task
//! itself has been destroyed.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;

use crate::context::SagaContext;
use crate::core::{CorrelationId, Event, TaskId};
use crate::error::SagaError;
use crate::scheduler::Core;

/// The future a routine runs as.
pub type SagaFuture = LocalBoxFuture<'static, anyhow::Result<()>>;

/// Builds a routine's future once the task is first stepped.
pub type Start<E> = Box<dyn FnOnce(SagaContext<E>) -> SagaFuture>;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created, not stepped yet.
    Created,
    /// Being stepped right now.
    Running,
    /// Parked on an awaited value.
    Suspended,
    /// Routine returned `Ok`.
    Done,
    /// Routine returned `Err` or panicked.
    Failed,
    /// Stopped by a cancel request at a step boundary.
    Cancelled,
}

impl TaskState {
    /// Check if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }

    /// Check if `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Done)
                | (Running, Failed)
                | (Created, Cancelled)
                | (Running, Cancelled)
                | (Suspended, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State shared between a task, its context and its handles.
#[derive(Debug)]
pub(crate) struct TaskStatus {
    id: TaskId,
    name: Rc<str>,
    cid: CorrelationId,
    state: Cell<TaskState>,
    cancel_requested: Cell<bool>,
}

impl TaskStatus {
    pub(crate) fn new(id: TaskId, name: Rc<str>, cid: CorrelationId) -> Self {
        Self {
            id,
            name,
            cid,
            state: Cell::new(TaskState::Created),
            cancel_requested: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &Rc<str> {
        &self.name
    }

    pub(crate) fn cid(&self) -> CorrelationId {
        self.cid
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn transition(&self, next: TaskState) -> Result<(), SagaError> {
        let from = self.state.get();
        if !from.can_transition_to(next) {
            return Err(SagaError::IllegalTransition {
                task: self.id,
                from,
                to: next,
            });
        }
        self.state.set(next);
        Ok(())
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.get()
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.set(true);
    }
}

/// What the scheduler holds in place of the routine between steps.
pub(crate) enum Routine<E: Event> {
    Start(Start<E>),
    Polling(SagaFuture),
}

/// A task as owned by the scheduler.
pub(crate) struct Task<E: Event> {
    pub(crate) status: Rc<TaskStatus>,
    pub(crate) parent: Option<TaskId>,
    pub(crate) children: Vec<TaskId>,
    /// `None` while the routine is out being polled.
    pub(crate) routine: Option<Routine<E>>,
}

impl<E: Event> Task<E> {
    pub(crate) fn new(status: Rc<TaskStatus>, parent: Option<TaskId>, start: Start<E>) -> Self {
        Self {
            status,
            parent,
            children: Vec::new(),
            routine: Some(Routine::Start(start)),
        }
    }
}

/// Handle to a task started by [`Scheduler::run`](crate::Scheduler::run),
/// [`SagaContext::fork`] or an effect.
pub struct TaskHandle<E: Event> {
    status: Rc<TaskStatus>,
    core: Weak<Core<E>>,
}

impl<E: Event> TaskHandle<E> {
    pub(crate) fn new(status: Rc<TaskStatus>, core: Weak<Core<E>>) -> Self {
        Self { status, core }
    }

    /// The task's id.
    pub fn id(&self) -> TaskId {
        self.status.id()
    }

    /// The task's name (routine type or effect label).
    pub fn name(&self) -> &str {
        self.status.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.status.state()
    }

    /// Correlation ID of the dispatch that forked this task.
    pub fn correlation_id(&self) -> CorrelationId {
        self.status.cid()
    }

    /// Check if the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Check if the task ended by cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Ask the task to stop.
    ///
    /// A suspended task is stopped right away: its routine is dropped
    /// without being resumed, its subscriptions are removed and its children
    /// are cancelled too. A task cancelling itself (or an ancestor) while it
    /// runs is stopped when its current step returns. Cancelled tasks never
    /// report failures. No-op on finished tasks.
    pub fn cancel(&self) {
        if self.is_finished() {
            return;
        }
        match self.core.upgrade() {
            Some(core) => core.cancel(self.id()),
            None => self.status.request_cancel(),
        }
    }
}

impl<E: Event> Clone for TaskHandle<E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status.clone(),
            core: self.core.clone(),
        }
    }
}

impl<E: Event> fmt::Debug for TaskHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
