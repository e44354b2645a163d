//! Emits the last `n` values of its source after the source completes.
//! Upstream runs unbounded; downstream demand gates only the replay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::arbiter::DeferredScalar;
use crate::demand::{self, post_complete, post_complete_request, UNBOUNDED};
use crate::fusion::{FusionMode, QueueSubscription};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, SubscriptionSlot, Upstream};

/// The last-`n` operator.
pub struct TakeLast<T> {
  source: Arc<dyn Publisher<T>>,
  n: usize,
}

impl<T: Send + 'static> TakeLast<T> {
  pub fn new(source: Arc<dyn Publisher<T>>, n: usize) -> Self {
    TakeLast { source, n }
  }
}

impl<T: Send + 'static> Publisher<T> for TakeLast<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    match self.n {
      0 => self.source.subscribe(Arc::new_cyclic(|me| {
        TakeLastZeroSubscriber {
          actual: subscriber,
          slot: SubscriptionSlot::new(),
          me: me.clone(),
        }
      })),
      1 => self.source.subscribe(Arc::new_cyclic(|me| {
        TakeLastOneSubscriber {
          scalar: DeferredScalar::new(subscriber),
          slot: SubscriptionSlot::new(),
          me: me.clone(),
        }
      })),
      n => self.source.subscribe(Arc::new_cyclic(|me| {
        TakeLastManySubscriber {
          actual: subscriber,
          n,
          buffer: Mutex::new(VecDeque::with_capacity(n)),
          slot: SubscriptionSlot::new(),
          requested: AtomicU64::new(0),
          cancelled: AtomicBool::new(false),
          me: me.clone(),
        }
      })),
    }
  }
}

/// Consumes everything, emits nothing.
struct TakeLastZeroSubscriber<T> {
  actual: Arc<dyn Subscriber<T>>,
  slot: SubscriptionSlot<T>,
  me: Weak<TakeLastZeroSubscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for TakeLastZeroSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.slot.set_once(upstream) {
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    self.actual.on_subscribe(Upstream::Plain(me));
    self.slot.request(UNBOUNDED);
  }

  fn on_next(&self, _value: T) {}

  fn on_error(&self, error: crate::error::StreamError) {
    self.actual.on_error(error);
  }

  fn on_complete(&self) { self.actual.on_complete(); }
}

impl<T: Send + 'static> Subscription for TakeLastZeroSubscriber<T> {
  fn request(&self, n: u64) {
    if demand::validate(n) {
      self.slot.request(n);
    }
  }

  fn cancel(&self) { self.slot.cancel(); }
}

/// Remembers only the most recent value; a deferred scalar handles the
/// emission race.
struct TakeLastOneSubscriber<T> {
  scalar: DeferredScalar<T>,
  slot: SubscriptionSlot<T>,
  me: Weak<TakeLastOneSubscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for TakeLastOneSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.slot.set_once(upstream) {
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    self.scalar.downstream().on_subscribe(Upstream::Fused(me));
    self.slot.request(UNBOUNDED);
  }

  fn on_next(&self, value: T) { self.scalar.stash(value); }

  fn on_error(&self, error: crate::error::StreamError) {
    self.scalar.downstream().on_error(error);
  }

  fn on_complete(&self) {
    match self.scalar.unstash() {
      Some(v) => self.scalar.complete(v),
      None => self.scalar.complete_empty(),
    }
  }
}

impl<T: Send + 'static> Subscription for TakeLastOneSubscriber<T> {
  fn request(&self, n: u64) { self.scalar.request(n); }

  fn cancel(&self) {
    self.scalar.cancel();
    self.slot.cancel();
  }
}

impl<T: Send + 'static> QueueSubscription<T> for TakeLastOneSubscriber<T> {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    self.scalar.request_fusion(mode)
  }

  fn poll(&self) -> Option<T> { self.scalar.poll() }

  fn is_empty(&self) -> bool { self.scalar.is_empty() }

  fn clear(&self) { self.scalar.clear(); }
}

/// Ring-buffers the last `n` values and replays them through the
/// post-complete demand protocol.
struct TakeLastManySubscriber<T> {
  actual: Arc<dyn Subscriber<T>>,
  n: usize,
  buffer: Mutex<VecDeque<T>>,
  slot: SubscriptionSlot<T>,
  requested: AtomicU64,
  cancelled: AtomicBool,
  me: Weak<TakeLastManySubscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for TakeLastManySubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.slot.set_once(upstream) {
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    self.actual.on_subscribe(Upstream::Plain(me));
    self.slot.request(UNBOUNDED);
  }

  fn on_next(&self, value: T) {
    let mut buffer = self.buffer.lock().unwrap();
    if buffer.len() == self.n {
      buffer.pop_front();
    }
    buffer.push_back(value);
  }

  fn on_error(&self, error: crate::error::StreamError) {
    self.actual.on_error(error);
  }

  fn on_complete(&self) {
    post_complete(&self.requested, &self.actual, &self.buffer, &self.cancelled);
  }
}

impl<T: Send + 'static> Subscription for TakeLastManySubscriber<T> {
  fn request(&self, n: u64) {
    if demand::validate(n) {
      post_complete_request(
        &self.requested,
        n,
        &self.actual,
        &self.buffer,
        &self.cancelled,
      );
    }
  }

  fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
    self.slot.cancel();
  }
}
