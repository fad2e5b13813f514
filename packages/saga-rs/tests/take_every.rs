//! take_every: forking a worker for every matching dispatch.

mod common;

use common::*;
use saga::{take_every, take_every_with, Deferred, Pattern, TaskState};

#[test]
fn worker_gets_the_action_as_first_argument() {
    let h = Harness::new();
    let order = Recorder::new();

    let o = order.clone();
    h.scheduler
        .run(take_every(on(1), move |_cx, a: Action| {
            o.push(a);
            async { Ok(()) }
        }))
        .unwrap();

    let dispatched = Action {
        kind: 1,
        extra: true,
    };
    h.scheduler.dispatch(dispatched.clone());

    assert_eq!(order.snapshot(), vec![dispatched]);
    h.scheduler.advance().unwrap();
    assert!(h.failures.is_empty());
}

#[test]
fn works_resolving_at_end() {
    let h = Harness::new();
    let order = Recorder::new();

    let o = order.clone();
    h.scheduler
        .run(take_every_with(
            on(1),
            move |_cx, _a: Action, args: (u32, u32)| {
                let o = o.clone();
                async move {
                    Deferred::resolved(()).await?;
                    o.push(args);
                    Ok(())
                }
            },
            (2, 3),
        ))
        .unwrap();

    h.scheduler.dispatch(action(1));
    h.scheduler.dispatch(action(2));
    h.scheduler.dispatch(action(1));
    assert!(order.is_empty());

    h.scheduler.drain().unwrap();
    assert_eq!(order.snapshot(), vec![(2, 3), (2, 3)]);
    h.scheduler.advance().unwrap();
    assert!(h.failures.is_empty());
}

#[test]
fn works_resolving_as_it_goes() {
    let h = Harness::new();
    let order = Recorder::new();

    let o = order.clone();
    h.scheduler
        .run(take_every_with(
            on(1),
            move |_cx, _a: Action, args: (u32, u32)| {
                let o = o.clone();
                async move {
                    Deferred::resolved(()).await?;
                    o.push(args);
                    Ok(())
                }
            },
            (2, 3),
        ))
        .unwrap();

    h.scheduler.dispatch(action(1));
    h.scheduler.dispatch(action(2));
    h.scheduler.drain().unwrap();
    assert_eq!(order.len(), 1);

    h.scheduler.dispatch(action(1));
    h.scheduler.drain().unwrap();
    assert_eq!(order.snapshot(), vec![(2, 3), (2, 3)]);
    h.scheduler.advance().unwrap();
    assert!(h.failures.is_empty());
}

#[test]
fn works_sync() {
    let h = Harness::new();
    let order = Recorder::new();

    let o = order.clone();
    h.scheduler
        .run(take_every_with(
            on(1),
            move |_cx, _a: Action, args: (u32, u32)| {
                o.push(args);
                async { Ok(()) }
            },
            (2, 3),
        ))
        .unwrap();

    h.scheduler.dispatch(action(1));
    h.scheduler.dispatch(action(2));
    h.scheduler.dispatch(action(1));

    // no drain: synchronous workers finish inside dispatch
    assert_eq!(order.snapshot(), vec![(2, 3), (2, 3)]);
    assert_eq!(h.scheduler.pending_resumptions(), 0);
    assert!(h.failures.is_empty());
}

#[derive(Debug, thiserror::Error)]
#[error("worker exception")]
struct WorkerException;

#[test]
fn reports_failures_on_a_later_turn() {
    let h = Harness::new();

    h.scheduler
        .run(take_every(Pattern::any(), |_cx, _a: Action| async {
            Err(WorkerException.into())
        }))
        .unwrap();

    h.scheduler.dispatch(action(1));
    h.scheduler.dispatch(action(2));
    assert_eq!(h.failures.len(), 0);

    let turn = h.scheduler.advance().unwrap();
    assert_eq!(turn.reported, 2);
    assert_eq!(h.failures.len(), 2);

    for failure in h.failures.take() {
        assert!(failure.downcast_ref::<WorkerException>().is_some());
        assert!(failure.correlation_id.is_some());
    }
}

#[test]
fn watcher_stays_suspended_and_owns_one_subscription() {
    let h = Harness::new();

    let watcher = h
        .scheduler
        .run(take_every(on(1), |_cx, _a: Action| async { Ok(()) }))
        .unwrap();

    assert_eq!(watcher.state(), TaskState::Suspended);
    assert!(watcher.name().contains("take_every"));
    assert_eq!(h.scheduler.subscription_count(), 1);

    for _ in 0..10 {
        h.scheduler.dispatch(action(1));
    }
    h.scheduler.advance().unwrap();

    assert_eq!(watcher.state(), TaskState::Suspended);
    assert_eq!(h.scheduler.subscription_count(), 1);
    assert_eq!(h.scheduler.task_count(), 1);
}

#[test]
fn one_of_and_predicate_patterns() {
    let h = Harness::new();
    let kinds = Recorder::new();
    let extras = Recorder::new();

    let k = kinds.clone();
    h.scheduler
        .run(take_every(Pattern::one_of([1, 3]), move |_cx, a: Action| {
            k.push(a.kind);
            async { Ok(()) }
        }))
        .unwrap();

    let e = extras.clone();
    h.scheduler
        .run(take_every(
            Pattern::predicate(|a: &Action| a.extra),
            move |_cx, a: Action| {
                e.push(a.kind);
                async { Ok(()) }
            },
        ))
        .unwrap();

    for kind in 0..5 {
        h.scheduler.dispatch(Action {
            kind,
            extra: kind % 2 == 0,
        });
    }

    assert_eq!(kinds.snapshot(), vec![1, 3]);
    assert_eq!(extras.snapshot(), vec![0, 2, 4]);
}

#[test]
fn empty_one_of_is_rejected_before_anything_is_created() {
    let h = Harness::new();

    let result = h.scheduler.run(take_every(
        Pattern::one_of(Vec::<u32>::new()),
        |_cx, _a: Action| async { Ok(()) },
    ));

    assert!(matches!(result, Err(saga::SagaError::EmptyPattern)));
    assert_eq!(h.scheduler.task_count(), 0);
    assert_eq!(h.scheduler.subscription_count(), 0);
}
