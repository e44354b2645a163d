//! Reduces a family of parallel rails into one value: each rail folds its
//! own stream, completed rail results are paired opportunistically and
//! reduced until a single carry remains.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::arbiter::DeferredScalar;
use crate::demand::UNBOUNDED;
use crate::error::{catch_callback, on_error_dropped, StreamError};
use crate::fusion::{FusionMode, QueueSubscription};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, SubscriptionSlot, Upstream};

/// The associative combine applied within and across rails.
pub type Reducer<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

/// The rails-to-single-value reduction operator.
pub struct ReduceFull<T> {
  rails: Vec<Arc<dyn Publisher<T>>>,
  reducer: Reducer<T>,
}

impl<T: Send + 'static> ReduceFull<T> {
  pub fn new(
    rails: Vec<Arc<dyn Publisher<T>>>,
    reducer: impl Fn(T, T) -> T + Send + Sync + 'static,
  ) -> Self {
    ReduceFull { rails, reducer: Arc::new(reducer) }
  }
}

impl<T: Send + 'static> Publisher<T> for ReduceFull<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let coordinator = ReduceCoordinator::new(
      subscriber.clone(),
      self.rails.len(),
      self.reducer.clone(),
    );
    subscriber.on_subscribe(Upstream::Fused(coordinator.clone()));
    if self.rails.is_empty() {
      coordinator.scalar.complete_empty();
      return;
    }
    for (rail, inner) in self.rails.iter().zip(&coordinator.rails) {
      rail.subscribe(inner.clone());
    }
  }
}

/// A two-slot rendezvous. Writers acquire an index by CAS, store their
/// value, and the releasing writer that fills the pair hands it on.
struct SlotPair<T> {
  first: Mutex<Option<T>>,
  second: Mutex<Option<T>>,
  acquired: AtomicU8,
  released: AtomicU8,
}

impl<T> SlotPair<T> {
  fn new() -> Arc<Self> {
    Arc::new(SlotPair {
      first: Mutex::new(None),
      second: Mutex::new(None),
      acquired: AtomicU8::new(0),
      released: AtomicU8::new(0),
    })
  }

  /// Claims slot 0 or 1, or reports the pair full with `None`.
  fn try_acquire(&self) -> Option<u8> {
    let mut acquired = self.acquired.load(Ordering::Acquire);
    loop {
      if acquired >= 2 {
        return None;
      }
      match self.acquired.compare_exchange(
        acquired,
        acquired + 1,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Some(acquired),
        Err(observed) => acquired = observed,
      }
    }
  }

  /// True for the writer whose release completes the pair.
  fn release(&self) -> bool {
    self.released.fetch_add(1, Ordering::AcqRel) == 1
  }
}

struct ReduceCoordinator<T> {
  scalar: DeferredScalar<T>,
  rails: Vec<Arc<ReduceRail<T>>>,
  reducer: Reducer<T>,
  current: Mutex<Option<Arc<SlotPair<T>>>>,
  remaining: AtomicUsize,
  errored: AtomicBool,
}

impl<T: Send + 'static> ReduceCoordinator<T> {
  fn new(
    actual: Arc<dyn Subscriber<T>>,
    n: usize,
    reducer: Reducer<T>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|me: &Weak<Self>| ReduceCoordinator {
      scalar: DeferredScalar::new(actual),
      rails: (0..n)
        .map(|_| {
          Arc::new(ReduceRail {
            parent: me.clone(),
            reducer: reducer.clone(),
            slot: SubscriptionSlot::new(),
            value: Mutex::new(None),
            done: AtomicBool::new(false),
          })
        })
        .collect(),
      reducer,
      current: Mutex::new(None),
      remaining: AtomicUsize::new(n),
      errored: AtomicBool::new(false),
    })
  }

  /// Offers a rail result for pairing. Returns the completed pair when this
  /// writer filled it.
  fn add_value(&self, value: T) -> Option<Arc<SlotPair<T>>> {
    let mut pending = Some(value);
    loop {
      let pair = {
        let mut current = self.current.lock().unwrap();
        match &*current {
          Some(p) => p.clone(),
          None => {
            let p = SlotPair::new();
            *current = Some(p.clone());
            p
          }
        }
      };
      match pair.try_acquire() {
        None => {
          let mut current = self.current.lock().unwrap();
          if let Some(active) = &*current {
            if Arc::ptr_eq(active, &pair) {
              *current = None;
            }
          }
          continue;
        }
        Some(0) => *pair.first.lock().unwrap() = pending.take(),
        Some(_) => *pair.second.lock().unwrap() = pending.take(),
      }
      if pair.release() {
        let mut current = self.current.lock().unwrap();
        if let Some(active) = &*current {
          if Arc::ptr_eq(active, &pair) {
            *current = None;
          }
        }
        return Some(pair);
      }
      return None;
    }
  }

  fn cancel_rails(&self) {
    for rail in &self.rails {
      rail.slot.cancel();
    }
  }

  fn rail_error(&self, error: StreamError) {
    if self.errored.swap(true, Ordering::AcqRel) {
      on_error_dropped(error);
      return;
    }
    self.cancel_rails();
    self.scalar.downstream().on_error(error);
  }

  fn rail_complete(&self, value: Option<T>) {
    if let Some(value) = value {
      let mut carry = value;
      loop {
        let Some(pair) = self.add_value(carry) else { break };
        let first = pair.first.lock().unwrap().take();
        let second = pair.second.lock().unwrap().take();
        let (Some(a), Some(b)) = (first, second) else { return };
        match catch_callback(|| (self.reducer)(a, b)) {
          Err(e) => {
            self.rail_error(e);
            return;
          }
          Ok(v) => carry = v,
        }
      }
    }
    if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
      let last = self.current.lock().unwrap().take();
      match last.and_then(|pair| pair.first.lock().unwrap().take()) {
        Some(v) => self.scalar.complete(v),
        None => self.scalar.complete_empty(),
      }
    }
  }
}

impl<T: Send + 'static> Subscription for ReduceCoordinator<T> {
  fn request(&self, n: u64) { self.scalar.request(n); }

  fn cancel(&self) {
    self.scalar.cancel();
    self.cancel_rails();
  }
}

impl<T: Send + 'static> QueueSubscription<T> for ReduceCoordinator<T> {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    self.scalar.request_fusion(mode)
  }

  fn poll(&self) -> Option<T> { self.scalar.poll() }

  fn is_empty(&self) -> bool { self.scalar.is_empty() }

  fn clear(&self) { self.scalar.clear(); }
}

/// Folds one rail locally; hands its result to the coordinator on
/// completion.
struct ReduceRail<T> {
  parent: Weak<ReduceCoordinator<T>>,
  reducer: Reducer<T>,
  slot: SubscriptionSlot<T>,
  value: Mutex<Option<T>>,
  done: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for ReduceRail<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if self.slot.set_once(upstream) {
      self.slot.request(UNBOUNDED);
    }
  }

  fn on_next(&self, value: T) {
    if self.done.load(Ordering::Acquire) {
      return;
    }
    let accumulated = self.value.lock().unwrap().take();
    match accumulated {
      None => *self.value.lock().unwrap() = Some(value),
      Some(acc) => match catch_callback(|| (self.reducer)(acc, value)) {
        Err(e) => {
          self.slot.cancel();
          self.on_error(e);
        }
        Ok(v) => *self.value.lock().unwrap() = Some(v),
      },
    }
  }

  fn on_error(&self, error: StreamError) {
    if self.done.swap(true, Ordering::AcqRel) {
      on_error_dropped(error);
      return;
    }
    let Some(parent) = self.parent.upgrade() else { return };
    parent.rail_error(error);
  }

  fn on_complete(&self) {
    if self.done.swap(true, Ordering::AcqRel) {
      return;
    }
    let value = self.value.lock().unwrap().take();
    let Some(parent) = self.parent.upgrade() else { return };
    parent.rail_complete(value);
  }
}
