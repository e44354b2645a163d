//! Execution resources for asynchronous operators: schedulers hand out
//! workers, workers run tasks, tasks are individually disposable.

use std::sync::Arc;

pub mod cached;

pub use cached::CachedThreadScheduler;

/// A unit of work submitted to a worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Returned when a task is handed to a scheduler or worker that has shut
/// down. Rejection is terminal for the submitting operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

/// A handle to a submitted task.
pub trait Disposable: Send + Sync {
  /// Cancels the task if it has not started. A task that is already
  /// running completes normally; cancellation is cooperative.
  fn dispose(&self);

  /// True once the task finished or was cancelled.
  fn is_disposed(&self) -> bool;
}

/// A serial execution resource. Tasks scheduled on one worker run in
/// submission order, one at a time.
pub trait Worker: Send + Sync {
  fn schedule(&self, task: Task) -> Result<Arc<dyn Disposable>, Rejected>;

  /// Cancels every pending task and releases the underlying execution
  /// resource. Idempotent.
  fn shutdown(&self);
}

/// A factory of workers plus a direct submission path for fire-and-forget
/// tasks.
pub trait Scheduler: Send + Sync {
  fn schedule(&self, task: Task) -> Result<Arc<dyn Disposable>, Rejected>;

  fn create_worker(&self) -> Arc<dyn Worker>;

  /// Transitions the scheduler into its terminal state: idle and live
  /// execution resources are stopped and every later submission is
  /// rejected.
  fn shutdown(&self);
}
