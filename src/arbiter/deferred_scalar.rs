//! A one-value-at-most emitter that gates the race between the request for
//! a value and the value becoming available.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::demand;
use crate::fusion::{FusionMode, QueueSubscription};
use crate::subscriber::Subscriber;
use crate::subscription::Subscription;

const NO_REQUEST_NO_VALUE: u8 = 0;
const NO_REQUEST_HAS_VALUE: u8 = 1;
const HAS_REQUEST_NO_VALUE: u8 = 2;
const HAS_REQUEST_HAS_VALUE: u8 = 3;

/// Emits at most one value to its downstream, no matter how `request`,
/// the value production and `cancel` interleave.
///
/// Each state transition happens exactly once; `on_next`/`on_complete` are
/// delivered at most once; a racing `cancel` preempts any pending emission.
/// When async output fusion is negotiated the value is handed over through
/// `poll` instead, announced by `on_poll_ready`.
pub struct DeferredScalar<T> {
  downstream: Arc<dyn Subscriber<T>>,
  state: AtomicU8,
  value: Mutex<Option<T>>,
  output_fused: AtomicBool,
}

impl<T: Send + 'static> DeferredScalar<T> {
  pub fn new(downstream: Arc<dyn Subscriber<T>>) -> Self {
    DeferredScalar {
      downstream,
      state: AtomicU8::new(NO_REQUEST_NO_VALUE),
      value: Mutex::new(None),
      output_fused: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn downstream(&self) -> &Arc<dyn Subscriber<T>> { &self.downstream }

  #[inline]
  pub fn is_cancelled(&self) -> bool {
    self.state.load(Ordering::Acquire) == HAS_REQUEST_HAS_VALUE
  }

  fn transition(&self, from: u8, to: u8) -> bool {
    self
      .state
      .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn emit(&self, value: T) {
    if self.output_fused.load(Ordering::Acquire) {
      *self.value.lock().unwrap() = Some(value);
      self.downstream.on_poll_ready();
      if self.state.load(Ordering::Acquire) != HAS_REQUEST_HAS_VALUE {
        self.downstream.on_complete();
      }
    } else {
      self.downstream.on_next(value);
      if self.state.load(Ordering::Acquire) != HAS_REQUEST_HAS_VALUE {
        self.downstream.on_complete();
      }
    }
  }

  /// Tries to emit `value` or stores it until a request arrives. Must be
  /// called at most once.
  pub fn complete(&self, value: T) {
    let mut pending = Some(value);
    loop {
      match self.state.load(Ordering::Acquire) {
        NO_REQUEST_HAS_VALUE | HAS_REQUEST_HAS_VALUE => return,
        HAS_REQUEST_NO_VALUE => {
          let Some(v) = pending.take() else { return };
          self.emit(v);
          return;
        }
        _ => {
          // Stash before publishing the state so a concurrent request
          // observing the transition always finds the value.
          *self.value.lock().unwrap() = pending.take();
          if self.transition(NO_REQUEST_NO_VALUE, NO_REQUEST_HAS_VALUE) {
            return;
          }
          pending = self.value.lock().unwrap().take();
          if pending.is_none() {
            return;
          }
        }
      }
    }
  }

  /// Overwrites the held value without any state transition; for operators
  /// that track "latest seen" before deciding to complete.
  pub(crate) fn stash(&self, value: T) {
    *self.value.lock().unwrap() = Some(value);
  }

  pub(crate) fn unstash(&self) -> Option<T> {
    self.value.lock().unwrap().take()
  }

  /// Completes without a value.
  pub fn complete_empty(&self) {
    if self.state.load(Ordering::Acquire) != HAS_REQUEST_HAS_VALUE {
      self.downstream.on_complete();
    }
  }
}

impl<T: Send + 'static> Subscription for DeferredScalar<T> {
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      return;
    }
    loop {
      match self.state.load(Ordering::Acquire) {
        HAS_REQUEST_NO_VALUE | HAS_REQUEST_HAS_VALUE => return,
        NO_REQUEST_HAS_VALUE => {
          if self.transition(NO_REQUEST_HAS_VALUE, HAS_REQUEST_HAS_VALUE) {
            if self.output_fused.load(Ordering::Acquire) {
              self.downstream.on_poll_ready();
              self.downstream.on_complete();
            } else if let Some(v) = self.value.lock().unwrap().take() {
              self.downstream.on_next(v);
              self.downstream.on_complete();
            }
          }
          return;
        }
        _ => {
          if self.transition(NO_REQUEST_NO_VALUE, HAS_REQUEST_NO_VALUE) {
            return;
          }
        }
      }
    }
  }

  fn cancel(&self) {
    self.state.store(HAS_REQUEST_HAS_VALUE, Ordering::Release);
    if !self.output_fused.load(Ordering::Acquire) {
      self.value.lock().unwrap().take();
    }
  }
}

impl<T: Send + 'static> QueueSubscription<T> for DeferredScalar<T> {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    match mode {
      FusionMode::Async | FusionMode::Any => {
        self.output_fused.store(true, Ordering::Release);
        FusionMode::Async
      }
      _ => FusionMode::None,
    }
  }

  fn poll(&self) -> Option<T> {
    if self.output_fused.load(Ordering::Acquire) {
      return self.value.lock().unwrap().take();
    }
    None
  }

  fn is_empty(&self) -> bool {
    !self.output_fused.load(Ordering::Acquire)
      || self.value.lock().unwrap().is_none()
  }

  fn clear(&self) {
    self.output_fused.store(false, Ordering::Release);
    self.value.lock().unwrap().take();
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::testkit::{Signal, TestSubscriber};

  #[test]
  fn request_then_value_emits_immediately() {
    let ts = TestSubscriber::<i32>::with_request(0);
    let scalar = DeferredScalar::new(ts.clone() as Arc<dyn Subscriber<i32>>);
    scalar.request(1);
    scalar.complete(42);
    assert_eq!(ts.signals(), vec![Signal::Next(42), Signal::Complete]);
  }

  #[test]
  fn value_waits_for_the_request() {
    let ts = TestSubscriber::<i32>::with_request(0);
    let scalar = DeferredScalar::new(ts.clone() as Arc<dyn Subscriber<i32>>);
    scalar.complete(42);
    assert!(ts.signals().is_empty());
    scalar.request(1);
    assert_eq!(ts.signals(), vec![Signal::Next(42), Signal::Complete]);
  }

  #[test]
  fn cancel_preempts_a_stored_value() {
    let ts = TestSubscriber::<i32>::with_request(0);
    let scalar = DeferredScalar::new(ts.clone() as Arc<dyn Subscriber<i32>>);
    scalar.complete(42);
    scalar.cancel();
    scalar.request(1);
    assert!(ts.signals().is_empty());
    assert!(scalar.is_cancelled());
  }

  #[test]
  fn repeated_requests_do_not_re_emit() {
    let ts = TestSubscriber::<i32>::with_request(0);
    let scalar = DeferredScalar::new(ts.clone() as Arc<dyn Subscriber<i32>>);
    scalar.complete(7);
    scalar.request(1);
    scalar.request(1);
    assert_eq!(ts.signals(), vec![Signal::Next(7), Signal::Complete]);
  }

  #[test]
  fn fused_output_hands_the_value_over_poll_exactly_once() {
    let ts = TestSubscriber::<i32>::with_request(0);
    let scalar = DeferredScalar::new(ts.clone() as Arc<dyn Subscriber<i32>>);
    assert_eq!(scalar.request_fusion(FusionMode::Any), FusionMode::Async);
    assert!(scalar.is_empty());
    scalar.complete(9);
    assert!(ts.signals().is_empty());
    assert!(!scalar.is_empty());
    scalar.request(1);
    assert_eq!(ts.poll_ready_count(), 1);
    assert_eq!(ts.signals(), vec![Signal::Complete]);
    assert_eq!(scalar.poll(), Some(9));
    assert_eq!(scalar.poll(), None);
    assert!(scalar.is_empty());
  }

  #[test]
  fn sync_fusion_is_declined() {
    let ts = TestSubscriber::<i32>::with_request(0);
    let scalar = DeferredScalar::new(ts as Arc<dyn Subscriber<i32>>);
    assert_eq!(scalar.request_fusion(FusionMode::Sync), FusionMode::None);
  }
}
