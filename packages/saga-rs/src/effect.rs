//! Effect descriptors and the things a scheduler can run.
//!
//! An [`Effect`] is inert data describing work for the scheduler. Performing
//! it (from [`Scheduler::run`](crate::Scheduler::run) or
//! [`SagaContext::perform`]) is what actually registers subscriptions and
//! creates tasks.
//!
//! # take_every
//!
//! ```text
//! perform(take_every(pattern, worker, args))
//!   compile(pattern)                 EmptyPattern returned here, nothing created
//!   watcher task  (child of host)    suspends forever, owns the subscription
//!   subscribe(matcher, on_match)
//!   ◄── watcher's TaskHandle
//!
//! dispatch(event) ─► on_match(event)
//!   fork worker(cx, event, args)     child of the watcher
//!   step it until its first suspension, inside the dispatch
//! ```
//!
//! Cancelling the watcher removes the subscription and cancels every worker
//! still running under it.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::{self, FutureExt};
use tracing::debug;

use crate::context::SagaContext;
use crate::core::{CorrelationId, Event, TaskId};
use crate::error::SagaError;
use crate::pattern::Pattern;
use crate::registry::OnMatch;
use crate::scheduler::Core;
use crate::task::{SagaFuture, Start, TaskHandle};

type Worker<E> = Rc<dyn Fn(SagaContext<E>, E) -> SagaFuture>;

/// Work for the scheduler to perform.
pub enum Effect<E: Event> {
    /// Fork a worker for every matching dispatched event.
    TakeEvery(TakeEvery<E>),
}

/// Payload of [`Effect::TakeEvery`]. Build it with [`take_every`] or
/// [`take_every_with`].
pub struct TakeEvery<E: Event> {
    pattern: Pattern<E>,
    worker: Worker<E>,
    worker_name: Rc<str>,
}

impl<E: Event> TakeEvery<E> {
    /// The pattern this effect watches for.
    pub fn pattern(&self) -> &Pattern<E> {
        &self.pattern
    }
}

/// Fork `worker` for every dispatched event matching `pattern`.
///
/// The worker receives the matching event.
///
/// # Example
///
/// ```ignore
/// scheduler.run(take_every(Pattern::exact(ActionKind::Save), |cx, action| async move {
///     save(&action).await?;
///     cx.dispatch(Action::saved(action.id))?;
///     Ok(())
/// }))?;
/// ```
pub fn take_every<E, F, Fut>(pattern: Pattern<E>, worker: F) -> Effect<E>
where
    E: Event,
    F: Fn(SagaContext<E>, E) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    let worker: Worker<E> =
        Rc::new(move |cx: SagaContext<E>, event: E| -> SagaFuture { worker(cx, event).boxed_local() });
    Effect::TakeEvery(TakeEvery {
        pattern,
        worker,
        worker_name: Rc::from(type_name::<F>()),
    })
}

/// Like [`take_every`], with extra arguments cloned into every worker after
/// the event.
pub fn take_every_with<E, A, F, Fut>(pattern: Pattern<E>, worker: F, args: A) -> Effect<E>
where
    E: Event,
    A: Clone + 'static,
    F: Fn(SagaContext<E>, E, A) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    let worker: Worker<E> = Rc::new(move |cx: SagaContext<E>, event: E| -> SagaFuture {
        worker(cx, event, args.clone()).boxed_local()
    });
    Effect::TakeEvery(TakeEvery {
        pattern,
        worker,
        worker_name: Rc::from(type_name::<F>()),
    })
}

impl<E: Event> Effect<E> {
    /// Perform the effect on behalf of `host`.
    pub(crate) fn perform(
        self,
        core: &Rc<Core<E>>,
        host: Option<TaskId>,
        cid: CorrelationId,
    ) -> Result<TaskHandle<E>, SagaError> {
        match self {
            Effect::TakeEvery(effect) => effect.perform(core, host, cid),
        }
    }
}

impl<E: Event> TakeEvery<E> {
    fn perform(
        self,
        core: &Rc<Core<E>>,
        host: Option<TaskId>,
        cid: CorrelationId,
    ) -> Result<TaskHandle<E>, SagaError> {
        let matcher = self.pattern.compile()?;
        let label = matcher.label().to_string();

        let watch: Start<E> = Box::new(|_cx: SagaContext<E>| {
            future::pending::<anyhow::Result<()>>().boxed_local()
        });
        let watcher = core.spawn(
            Rc::from(format!("take_every({})", label)),
            host,
            cid,
            watch,
        );
        let watcher_id = watcher.id();

        let weak = Rc::downgrade(core);
        let worker = self.worker;
        let worker_name = self.worker_name;
        let on_match: OnMatch<E> = Rc::new(move |event: &E| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let worker = worker.clone();
            let event = event.clone();
            let start: Start<E> = Box::new(move |cx: SagaContext<E>| worker(cx, event));
            core.spawn(
                worker_name.clone(),
                Some(watcher_id),
                core.dispatch_cid(),
                start,
            );
        });

        let subscription = core.subscribe(matcher, on_match, watcher_id);
        debug!(
            watcher = %watcher_id,
            subscription = %subscription,
            pattern = %label,
            "take_every watching"
        );
        Ok(watcher)
    }
}

impl<E: Event> fmt::Debug for Effect<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::TakeEvery(effect) => f
                .debug_struct("TakeEvery")
                .field("pattern", &effect.pattern)
                .field("worker", &effect.worker_name)
                .finish(),
        }
    }
}

/// Something [`Scheduler::run`](crate::Scheduler::run) or
/// [`SagaContext::fork`] can start: an effect or a routine.
pub enum Saga<E: Event> {
    /// Perform an effect.
    Effect(Effect<E>),
    /// Run a routine as a new task.
    Routine {
        /// Task name.
        name: &'static str,
        /// Builds the routine's future.
        start: Start<E>,
    },
}

impl<E: Event> fmt::Debug for Saga<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Saga::Effect(effect) => f.debug_tuple("Effect").field(effect).finish(),
            Saga::Routine { name, .. } => f.debug_struct("Routine").field("name", name).finish(),
        }
    }
}

/// Conversion into a [`Saga`].
///
/// Implemented for [`Effect`] and for any `FnOnce(SagaContext<E>) -> impl
/// Future<Output = anyhow::Result<()>>`, so both can be passed to `run` and
/// `fork` directly.
pub trait IntoSaga<E: Event> {
    /// Perform the conversion.
    fn into_saga(self) -> Saga<E>;
}

impl<E: Event> IntoSaga<E> for Saga<E> {
    fn into_saga(self) -> Saga<E> {
        self
    }
}

impl<E: Event> IntoSaga<E> for Effect<E> {
    fn into_saga(self) -> Saga<E> {
        Saga::Effect(self)
    }
}

impl<E, F, Fut> IntoSaga<E> for F
where
    E: Event,
    F: FnOnce(SagaContext<E>) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    fn into_saga(self) -> Saga<E> {
        Saga::Routine {
            name: type_name::<F>(),
            start: Box::new(move |cx: SagaContext<E>| self(cx).boxed_local()),
        }
    }
}
