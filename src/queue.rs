//! The queue an operator drains from: owned (bounded or unbounded) or the
//! fused view of its upstream.

use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::fusion::QueueSubscription;

pub(crate) enum OpQueue<T> {
  Bounded(ArrayQueue<T>),
  Unbounded(SegQueue<T>),
  Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T> OpQueue<T> {
  pub(crate) fn bounded(capacity: usize) -> Self {
    OpQueue::Bounded(ArrayQueue::new(capacity))
  }

  pub(crate) fn unbounded() -> Self { OpQueue::Unbounded(SegQueue::new()) }

  /// Enqueues a value into an owned queue. Offering to a fused view is a
  /// protocol violation and is reported as a full queue.
  pub(crate) fn offer(&self, value: T) -> Result<(), T> {
    match self {
      OpQueue::Bounded(q) => q.push(value),
      OpQueue::Unbounded(q) => {
        q.push(value);
        Ok(())
      }
      OpQueue::Fused(_) => {
        debug_assert!(false, "offer through a fused queue view");
        Err(value)
      }
    }
  }

  pub(crate) fn poll(&self) -> Option<T> {
    match self {
      OpQueue::Bounded(q) => q.pop(),
      OpQueue::Unbounded(q) => q.pop(),
      OpQueue::Fused(q) => q.poll(),
    }
  }

  pub(crate) fn is_empty(&self) -> bool {
    match self {
      OpQueue::Bounded(q) => q.is_empty(),
      OpQueue::Unbounded(q) => q.is_empty(),
      OpQueue::Fused(q) => q.is_empty(),
    }
  }

  pub(crate) fn clear(&self) {
    match self {
      OpQueue::Bounded(q) => while q.pop().is_some() {},
      OpQueue::Unbounded(q) => while q.pop().is_some() {},
      OpQueue::Fused(q) => q.clear(),
    }
  }
}
