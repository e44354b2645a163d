//! The producer-side half of the contract: subscriptions, the upstream link
//! handed to subscribers, and the set-once slot every inner subscriber
//! guards its upstream with.

use std::sync::{Arc, Mutex};

use crate::error::{on_error_dropped, StreamError};
use crate::fusion::QueueSubscription;
use crate::subscriber::Subscriber;

/// Demand and cancellation for one subscriber/producer pair.
pub trait Subscription: Send + Sync {
  /// Adds `n` to the outstanding demand. Demand is additive and saturates
  /// at [`crate::demand::UNBOUNDED`]; `n == 0` is a protocol violation.
  fn request(&self, n: u64);

  /// Stops the flow. Idempotent, non-blocking, never panics, and may race
  /// freely with terminal signals.
  fn cancel(&self);
}

/// The upstream link delivered through `on_subscribe`: either a plain
/// subscription or one that additionally supports queue fusion.
pub enum Upstream<T> {
  Plain(Arc<dyn Subscription>),
  Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T> Clone for Upstream<T> {
  fn clone(&self) -> Self {
    match self {
      Upstream::Plain(s) => Upstream::Plain(s.clone()),
      Upstream::Fused(q) => Upstream::Fused(q.clone()),
    }
  }
}

impl<T> Upstream<T> {
  #[inline]
  pub fn request(&self, n: u64) {
    match self {
      Upstream::Plain(s) => s.request(n),
      Upstream::Fused(q) => q.request(n),
    }
  }

  #[inline]
  pub fn cancel(&self) {
    match self {
      Upstream::Plain(s) => s.cancel(),
      Upstream::Fused(q) => q.cancel(),
    }
  }

  /// The queue view, when the producer offered one.
  #[inline]
  pub fn fused(&self) -> Option<&Arc<dyn QueueSubscription<T>>> {
    match self {
      Upstream::Plain(_) => None,
      Upstream::Fused(q) => Some(q),
    }
  }
}

/// A no-op subscription for producers that terminate before any demand can
/// matter.
pub struct EmptySubscription;

impl Subscription for EmptySubscription {
  fn request(&self, _n: u64) {}

  fn cancel(&self) {}
}

impl EmptySubscription {
  /// Sends `on_subscribe` followed by `on_error`.
  pub fn error_to<T>(subscriber: &Arc<dyn Subscriber<T>>, error: StreamError) {
    subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
    subscriber.on_error(error);
  }

  /// Sends `on_subscribe` followed by `on_complete`.
  pub fn complete_to<T>(subscriber: &Arc<dyn Subscriber<T>>) {
    subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
    subscriber.on_complete();
  }
}

enum SlotState<T> {
  Empty,
  Active(Upstream<T>),
  Cancelled,
}

/// A set-once subscription holder. A second `set_once` cancels the incoming
/// subscription and reports the duplicate; `cancel` is idempotent and also
/// rejects any subscription that arrives later.
pub struct SubscriptionSlot<T> {
  state: Mutex<SlotState<T>>,
}

impl<T> Default for SubscriptionSlot<T> {
  fn default() -> Self { Self::new() }
}

impl<T> SubscriptionSlot<T> {
  pub fn new() -> Self {
    SubscriptionSlot { state: Mutex::new(SlotState::Empty) }
  }

  /// Installs `upstream` if the slot is still empty. On failure the
  /// incoming subscription is cancelled.
  pub fn set_once(&self, upstream: Upstream<T>) -> bool {
    let mut state = self.state.lock().unwrap();
    match &*state {
      SlotState::Empty => {
        *state = SlotState::Active(upstream);
        true
      }
      SlotState::Active(_) => {
        drop(state);
        upstream.cancel();
        on_error_dropped(StreamError::DuplicateSubscription);
        false
      }
      SlotState::Cancelled => {
        drop(state);
        upstream.cancel();
        false
      }
    }
  }

  /// Forwards a request to the active subscription, if any.
  pub fn request(&self, n: u64) {
    let target = {
      let state = self.state.lock().unwrap();
      match &*state {
        SlotState::Active(up) => Some(up.clone()),
        _ => None,
      }
    };
    if let Some(up) = target {
      up.request(n);
    }
  }

  /// Cancels and permanently closes the slot.
  pub fn cancel(&self) {
    let previous = {
      let mut state = self.state.lock().unwrap();
      std::mem::replace(&mut *state, SlotState::Cancelled)
    };
    if let SlotState::Active(up) = previous {
      up.cancel();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(&*self.state.lock().unwrap(), SlotState::Cancelled)
  }

  /// A clone of the active upstream, if any.
  pub fn get(&self) -> Option<Upstream<T>> {
    match &*self.state.lock().unwrap() {
      SlotState::Active(up) => Some(up.clone()),
      _ => None,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

  pub(crate) struct Probe {
    pub requested: AtomicU64,
    pub cancelled: AtomicBool,
  }

  impl Probe {
    pub fn new() -> Arc<Self> {
      Arc::new(Probe {
        requested: AtomicU64::new(0),
        cancelled: AtomicBool::new(false),
      })
    }
  }

  impl Subscription for Probe {
    fn request(&self, n: u64) {
      self.requested.fetch_add(n, Ordering::SeqCst);
    }

    fn cancel(&self) { self.cancelled.store(true, Ordering::SeqCst); }
  }

  #[test]
  fn slot_accepts_only_the_first_subscription() {
    let slot = SubscriptionSlot::new();
    let first = Probe::new();
    let second = Probe::new();
    assert!(slot.set_once(Upstream::<i32>::Plain(first.clone())));
    assert!(!slot.set_once(Upstream::<i32>::Plain(second.clone())));
    assert!(second.cancelled.load(Ordering::SeqCst));
    assert!(!first.cancelled.load(Ordering::SeqCst));

    slot.request(7);
    assert_eq!(first.requested.load(Ordering::SeqCst), 7);
  }

  #[test]
  fn cancelled_slot_rejects_later_subscriptions() {
    let slot = SubscriptionSlot::<i32>::new();
    slot.cancel();
    slot.cancel();
    assert!(slot.is_cancelled());
    let late = Probe::new();
    assert!(!slot.set_once(Upstream::Plain(late.clone())));
    assert!(late.cancelled.load(Ordering::SeqCst));
  }

  #[test]
  fn cancel_reaches_the_active_subscription() {
    let slot = SubscriptionSlot::<i32>::new();
    let active = Probe::new();
    assert!(slot.set_once(Upstream::Plain(active.clone())));
    slot.cancel();
    assert!(active.cancelled.load(Ordering::SeqCst));
    assert!(slot.get().is_none());
  }
}
