//! Failure reporting.
//!
//! A routine that fails never throws back into the dispatch that forked it.
//! Its error is queued here instead and handed to the configured
//! [`FailureSink`] on a later turn ([`Scheduler::flush_failures`] or
//! [`Scheduler::advance`]), strictly in failure order, exactly once.
//!
//! [`Scheduler::flush_failures`]: crate::Scheduler::flush_failures
//! [`Scheduler::advance`]: crate::Scheduler::advance

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::core::{CorrelationId, TaskId};

/// An uncaught routine failure.
#[derive(Debug)]
pub struct TaskFailure {
    /// The task whose routine failed.
    pub task: TaskId,
    /// The task's name.
    pub name: String,
    /// Correlation ID of the dispatch that forked the task.
    pub correlation_id: CorrelationId,
    /// The error exactly as the routine raised it.
    pub error: anyhow::Error,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

impl TaskFailure {
    pub(crate) fn new(
        task: TaskId,
        name: impl Into<String>,
        correlation_id: CorrelationId,
        error: anyhow::Error,
    ) -> Self {
        Self {
            task,
            name: name.into(),
            correlation_id,
            error,
            failed_at: Utc::now(),
        }
    }

    /// Downcast the original error.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) failed: {:#}", self.task, self.name, self.error)
    }
}

/// Receives uncaught failures, one call per failed task.
pub trait FailureSink {
    /// Handle one failure.
    fn on_failure(&self, failure: TaskFailure);
}

impl<F> FailureSink for F
where
    F: Fn(TaskFailure),
{
    fn on_failure(&self, failure: TaskFailure) {
        self(failure)
    }
}

/// Default sink: logs each failure at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn on_failure(&self, failure: TaskFailure) {
        let message = format!("{:#}", failure.error);
        error!(
            task = %failure.task,
            name = %failure.name,
            correlation_id = %failure.correlation_id,
            failed_at = %failure.failed_at,
            error = %message,
            "uncaught saga failure"
        );
    }
}

/// Collecting sink. Clones share the same log.
///
/// # Example
///
/// ```ignore
/// let log = FailureLog::new();
/// let scheduler = Scheduler::builder().with_failure_sink(log.clone()).build();
/// // ...
/// scheduler.advance()?;
/// assert_eq!(log.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    inner: Arc<Mutex<Vec<TaskFailure>>>,
}

impl FailureLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TaskFailure>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of failures received so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every failure received so far, oldest first.
    pub fn take(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.lock())
    }

    /// Error messages of the failures received so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|f| f.error.to_string()).collect()
    }

    /// Tasks that failed, oldest first.
    pub fn tasks(&self) -> Vec<TaskId> {
        self.lock().iter().map(|f| f.task).collect()
    }
}

impl FailureSink for FailureLog {
    fn on_failure(&self, failure: TaskFailure) {
        self.lock().push(failure);
    }
}

/// FIFO of failures waiting for the next reporting turn.
#[derive(Debug, Default)]
pub(crate) struct FailureReporter {
    pending: VecDeque<TaskFailure>,
    reported: u64,
}

impl FailureReporter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn report(&mut self, failure: TaskFailure) {
        debug!(
            task = %failure.task,
            correlation_id = %failure.correlation_id,
            queued = self.pending.len() + 1,
            "failure queued"
        );
        self.pending.push_back(failure);
    }

    /// Take the oldest queued failure.
    pub(crate) fn pop(&mut self) -> Option<TaskFailure> {
        let failure = self.pending.pop_front()?;
        self.reported += 1;
        Some(failure)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn reported(&self) -> u64 {
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn failure(n: u64, msg: &'static str) -> TaskFailure {
        TaskFailure::new(TaskId(n), "worker", CorrelationId::NONE, anyhow::anyhow!(msg))
    }

    #[test]
    fn test_reporter_is_fifo() {
        let mut reporter = FailureReporter::new();
        reporter.report(failure(1, "first"));
        reporter.report(failure(2, "second"));
        assert_eq!(reporter.len(), 2);

        assert_eq!(reporter.pop().map(|f| f.task), Some(TaskId(1)));
        assert_eq!(reporter.len(), 1);
        assert_eq!(reporter.pop().map(|f| f.task), Some(TaskId(2)));
        assert_eq!(reporter.len(), 0);
        assert_eq!(reporter.reported(), 2);
        assert!(reporter.pop().is_none());
    }

    #[test]
    fn test_failure_log_shares_between_clones() {
        let log = FailureLog::new();
        let sink = log.clone();
        sink.on_failure(failure(3, "boom"));

        assert_eq!(log.len(), 1);
        assert_eq!(log.messages(), vec!["boom"]);
        assert_eq!(log.tasks(), vec![TaskId(3)]);
        assert_eq!(log.take().len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_closure_sink() {
        let seen = RefCell::new(Vec::new());
        let sink = |f: TaskFailure| seen.borrow_mut().push(f.task);
        sink.on_failure(failure(9, "x"));
        assert_eq!(*seen.borrow(), vec![TaskId(9)]);
    }

    #[test]
    fn test_downcast_keeps_original_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("quota exceeded")]
        struct QuotaExceeded;

        let f = TaskFailure::new(TaskId(1), "w", CorrelationId::NONE, QuotaExceeded.into());
        assert!(f.downcast_ref::<QuotaExceeded>().is_some());
        assert!(f.to_string().contains("quota exceeded"));
    }
}
