//! A finite synchronous source over any cloneable iterator. Offers `Sync`
//! fusion, so fused consumers pull items directly instead of exchanging
//! request/next signals.

use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::demand::{self, add_capped};
use crate::fusion::{FusionMode, QueueSubscription};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, Upstream};

/// The publisher; each subscribe clones the iterator.
pub struct FromIter<I: Iterator> {
  iter: I,
}

pub fn from_iter<I>(iter: I) -> Arc<FromIter<I::IntoIter>>
where
  I: IntoIterator,
  I::IntoIter: Iterator<Item = I::Item> + Clone + Send + 'static,
  I::Item: Send + 'static,
{
  Arc::new(FromIter { iter: iter.into_iter() })
}

impl<T, I> Publisher<T> for FromIter<I>
where
  T: Send + 'static,
  I: Iterator<Item = T> + Clone + Send + Sync + 'static,
{
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let subscription = Arc::new(IterSubscription {
      iter: Mutex::new(self.iter.clone().peekable()),
      actual: subscriber.clone(),
      requested: AtomicU64::new(0),
      cancelled: AtomicBool::new(false),
      fused: AtomicBool::new(false),
    });
    subscriber.on_subscribe(Upstream::Fused(subscription));
  }
}

struct IterSubscription<T, I: Iterator<Item = T>> {
  iter: Mutex<Peekable<I>>,
  actual: Arc<dyn Subscriber<T>>,
  requested: AtomicU64,
  cancelled: AtomicBool,
  fused: AtomicBool,
}

impl<T, I> IterSubscription<T, I>
where
  T: Send + 'static,
  I: Iterator<Item = T> + Send + 'static,
{
  /// The demand counter doubles as the drain ticket: only the caller that
  /// moved it from zero runs this loop.
  fn drain(&self) {
    let mut emitted = 0u64;
    let mut r = self.requested.load(Ordering::Acquire);
    loop {
      while emitted != r {
        if self.cancelled.load(Ordering::Acquire) {
          return;
        }
        let next = self.iter.lock().unwrap().next();
        match next {
          None => {
            if !self.cancelled.load(Ordering::Acquire) {
              self.actual.on_complete();
            }
            return;
          }
          Some(v) => {
            self.actual.on_next(v);
            emitted += 1;
          }
        }
      }
      if self.cancelled.load(Ordering::Acquire) {
        return;
      }
      if self.iter.lock().unwrap().peek().is_none() {
        self.actual.on_complete();
        return;
      }
      r = self.requested.load(Ordering::Acquire);
      if r == emitted {
        r = self.requested.fetch_sub(emitted, Ordering::AcqRel) - emitted;
        if r == 0 {
          return;
        }
        emitted = 0;
      }
    }
  }
}

impl<T, I> Subscription for IterSubscription<T, I>
where
  T: Send + 'static,
  I: Iterator<Item = T> + Send + 'static,
{
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      return;
    }
    if self.fused.load(Ordering::Acquire) {
      return;
    }
    if add_capped(&self.requested, n) == 0 {
      self.drain();
    }
  }

  fn cancel(&self) { self.cancelled.store(true, Ordering::Release); }
}

impl<T, I> QueueSubscription<T> for IterSubscription<T, I>
where
  T: Send + 'static,
  I: Iterator<Item = T> + Send + 'static,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    match mode {
      FusionMode::Sync | FusionMode::Any => {
        self.fused.store(true, Ordering::Release);
        FusionMode::Sync
      }
      _ => FusionMode::None,
    }
  }

  fn poll(&self) -> Option<T> {
    if self.cancelled.load(Ordering::Acquire) {
      return None;
    }
    self.iter.lock().unwrap().next()
  }

  fn is_empty(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
      || self.iter.lock().unwrap().peek().is_none()
  }

  fn clear(&self) { self.cancelled.store(true, Ordering::Release); }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::testkit::{Signal, TestSubscriber};

  #[test]
  fn unbounded_demand_drains_everything() {
    let ts = TestSubscriber::<i32>::new();
    from_iter(0..5).subscribe(ts.clone());
    assert_eq!(ts.values(), vec![0, 1, 2, 3, 4]);
    assert!(ts.is_complete());
    assert_eq!(ts.subscribe_count(), 1);
  }

  #[test]
  fn emission_tracks_demand() {
    let ts = TestSubscriber::<i32>::with_request(0);
    from_iter(0..4).subscribe(ts.clone());
    assert!(ts.values().is_empty());
    ts.request(2);
    assert_eq!(ts.values(), vec![0, 1]);
    assert!(!ts.is_terminated());
    ts.request(2);
    assert_eq!(ts.values(), vec![0, 1, 2, 3]);
    assert!(ts.is_complete());
  }

  #[test]
  fn exhausting_demand_on_the_last_item_still_completes() {
    let ts = TestSubscriber::<i32>::with_request(0);
    from_iter(0..3).subscribe(ts.clone());
    ts.request(3);
    assert_eq!(
      ts.signals(),
      vec![
        Signal::Next(0),
        Signal::Next(1),
        Signal::Next(2),
        Signal::Complete
      ]
    );
  }

  #[test]
  fn cancel_stops_emission() {
    let ts = TestSubscriber::<i32>::with_request(0);
    from_iter(0..100).subscribe(ts.clone());
    ts.request(1);
    ts.cancel();
    ts.request(10);
    assert_eq!(ts.values(), vec![0]);
    assert!(!ts.is_terminated());
  }

  #[test]
  fn sync_fusion_pulls_without_signals() {
    let ts = TestSubscriber::<i32>::with_request(0);
    from_iter(1..=3).subscribe(ts.clone());
    let recording = ts.signals();
    assert!(recording.is_empty());

    // Grab the fused view the way an operator would inside on_subscribe.
    let publisher = from_iter(1..=3);
    let probe = FusionProbe::default();
    let probe = Arc::new(probe);
    publisher.subscribe(probe.clone());
    let polled = probe.polled.lock().unwrap().clone();
    assert_eq!(polled, vec![1, 2, 3]);
  }

  #[derive(Default)]
  struct FusionProbe {
    polled: Mutex<Vec<i32>>,
  }

  impl Subscriber<i32> for FusionProbe {
    fn on_subscribe(&self, upstream: Upstream<i32>) {
      let q = upstream.fused().expect("fused upstream").clone();
      assert_eq!(q.request_fusion(FusionMode::Any), FusionMode::Sync);
      assert!(!q.is_empty());
      let mut polled = self.polled.lock().unwrap();
      while let Some(v) = q.poll() {
        polled.push(v);
      }
      assert!(q.is_empty());
    }

    fn on_next(&self, _value: i32) {
      panic!("sync fusion must not push values");
    }

    fn on_error(&self, _error: crate::error::StreamError) {}

    fn on_complete(&self) {}
  }
}
