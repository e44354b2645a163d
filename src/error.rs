//! Error type, terminal-once error accumulation and the sink for errors that
//! arrive after a stream has already terminated.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};

use thiserror::Error;

/// The error vocabulary of a stream.
///
/// Application errors travel as [`StreamError::Message`]; everything else is
/// raised by the operators themselves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
  /// `request` was called with a zero amount.
  #[error("request amount must be positive")]
  ZeroRequest,
  /// A second subscription arrived for a slot that only accepts one.
  #[error("subscription already set")]
  DuplicateSubscription,
  /// A bounded inbound queue rejected an offer.
  #[error("queue is full")]
  QueueFull,
  /// Upstream delivered more items than were requested.
  #[error("more items produced than requested")]
  Overproduced,
  /// An emission was due while downstream demand was exhausted.
  #[error("could not emit value due to lack of requests")]
  InsufficientDemand,
  /// A task was handed to a scheduler or worker that had shut down.
  #[error("task submission rejected by a shut down scheduler")]
  SchedulerRejected,
  /// A user callback (zipper, reducer, selector, supplier) panicked.
  #[error("callback panicked: {0}")]
  Callback(String),
  /// An application-level error raised by a source.
  #[error("{0}")]
  Message(String),
  /// Several errors raced into the same terminal.
  #[error("multiple errors occurred")]
  Composite(Vec<StreamError>),
}

impl StreamError {
  /// Builds an application-level error from any displayable message.
  pub fn msg(message: impl Into<String>) -> Self {
    StreamError::Message(message.into())
  }
}

/// Runs a user callback, converting a panic into [`StreamError::Callback`].
pub(crate) fn catch_callback<R>(
  f: impl FnOnce() -> R,
) -> Result<R, StreamError> {
  catch_unwind(AssertUnwindSafe(f))
    .map_err(|p| StreamError::Callback(panic_message(p)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_owned()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_owned()
  }
}

const EMPTY: u8 = 0;
const PENDING: u8 = 1;
const TERMINATED: u8 = 2;

enum SlotInner {
  Empty,
  Pending(StreamError),
  Terminated,
}

/// Accumulates racing errors into a single composite and hands it out exactly
/// once. Errors recorded after the slot has terminated belong to the
/// unsignalled sink.
pub struct ErrorSlot {
  tag: AtomicU8,
  slot: Mutex<SlotInner>,
}

impl Default for ErrorSlot {
  fn default() -> Self { Self::new() }
}

impl ErrorSlot {
  pub fn new() -> Self {
    ErrorSlot { tag: AtomicU8::new(EMPTY), slot: Mutex::new(SlotInner::Empty) }
  }

  /// Folds `error` into the slot. Returns `false` when the slot has already
  /// terminated; the caller then owns routing the error to the sink.
  pub fn record(&self, error: StreamError) -> bool {
    let mut slot = self.slot.lock().unwrap();
    match &mut *slot {
      SlotInner::Terminated => false,
      SlotInner::Empty => {
        *slot = SlotInner::Pending(error);
        self.tag.store(PENDING, Ordering::Release);
        true
      }
      SlotInner::Pending(prev) => {
        if let StreamError::Composite(all) = prev {
          all.push(error);
        } else {
          let first = std::mem::replace(prev, StreamError::ZeroRequest);
          *prev = StreamError::Composite(vec![first, error]);
        }
        true
      }
    }
  }

  /// Terminates the slot and extracts whatever was accumulated.
  pub fn take(&self) -> Option<StreamError> {
    let mut slot = self.slot.lock().unwrap();
    self.tag.store(TERMINATED, Ordering::Release);
    match std::mem::replace(&mut *slot, SlotInner::Terminated) {
      SlotInner::Pending(e) => Some(e),
      _ => None,
    }
  }

  /// True while an error is recorded but not yet extracted.
  #[inline]
  pub fn is_pending(&self) -> bool {
    self.tag.load(Ordering::Acquire) == PENDING
  }
}

type DroppedHook = Box<dyn Fn(&StreamError) + Send + Sync>;

lazy_static! {
  static ref DROPPED_HOOK: RwLock<Option<DroppedHook>> = RwLock::new(None);
}

/// Receives errors that can no longer be delivered through `on_error`
/// because the stream already terminated. Defaults to log-and-drop.
pub fn on_error_dropped(error: StreamError) {
  let hook = DROPPED_HOOK.read().unwrap();
  match &*hook {
    Some(h) => h(&error),
    None => log::warn!("dropped unsignalled error: {error}"),
  }
}

/// Installs a process-wide hook for unsignalled errors; `None` restores the
/// logging default.
pub fn set_dropped_hook(hook: Option<DroppedHook>) {
  *DROPPED_HOOK.write().unwrap() = hook;
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;

  #[test]
  fn slot_records_and_terminates_once() {
    let slot = ErrorSlot::new();
    assert!(!slot.is_pending());
    assert!(slot.record(StreamError::msg("a")));
    assert!(slot.is_pending());
    assert_eq!(slot.take(), Some(StreamError::msg("a")));
    assert!(!slot.record(StreamError::msg("late")));
    assert_eq!(slot.take(), None);
  }

  #[test]
  fn slot_folds_racing_errors_into_composite() {
    let slot = ErrorSlot::new();
    assert!(slot.record(StreamError::msg("a")));
    assert!(slot.record(StreamError::msg("b")));
    match slot.take() {
      Some(StreamError::Composite(all)) => {
        assert_eq!(all, vec![StreamError::msg("a"), StreamError::msg("b")]);
      }
      other => panic!("expected composite, got {other:?}"),
    }
  }

  #[test]
  fn dropped_hook_observes_late_errors() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    set_dropped_hook(Some(Box::new(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    })));
    on_error_dropped(StreamError::msg("late"));
    set_dropped_hook(None);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn catch_callback_converts_panics() {
    let ok = catch_callback(|| 3);
    assert_eq!(ok, Ok(3));
    let err = catch_callback(|| -> i32 { panic!("boom") });
    assert_eq!(err, Err(StreamError::Callback("boom".into())));
  }
}
