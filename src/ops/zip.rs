//! Combines one item from every source per output, in lock step. Sources
//! known to be scalar at assembly time short-circuit the queue machinery.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicU8,
                        AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crossbeam_utils::CachePadded;
use smallvec::SmallVec;

use crate::arbiter::DeferredScalar;
use crate::demand::{self, add_capped, UNBOUNDED};
use crate::error::{catch_callback, on_error_dropped, ErrorSlot, StreamError};
use crate::fusion::{FusionMode, QueueSubscription};
use crate::publisher::{Publisher, Source};
use crate::queue::OpQueue;
use crate::subscriber::Subscriber;
use crate::subscription::{EmptySubscription, Subscription, SubscriptionSlot,
                          Upstream};

/// One combined row of inputs, one element per source.
pub type ZipRow<T> = SmallVec<[T; 8]>;

/// The combine function applied to each row.
pub type Zipper<T, R> = Arc<dyn Fn(ZipRow<T>) -> R + Send + Sync>;

const NORMAL: u8 = 0;
const SYNC: u8 = 1;
const ASYNC: u8 = 2;

/// The n-ary lock-step combine operator.
pub struct Zip<T, R> {
  sources: Vec<Source<T>>,
  zipper: Zipper<T, R>,
  prefetch: usize,
}

impl<T, R> Zip<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  pub fn new(
    sources: Vec<Source<T>>,
    zipper: impl Fn(ZipRow<T>) -> R + Send + Sync + 'static,
    prefetch: usize,
  ) -> Self {
    assert!(prefetch > 0, "prefetch > 0 required but it was {prefetch}");
    Zip { sources, zipper: Arc::new(zipper), prefetch }
  }
}

impl<T, R> Publisher<R> for Zip<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
    let n = self.sources.len();
    if n == 0 {
      EmptySubscription::complete_to(&subscriber);
      return;
    }

    // Evaluate every scalar up front; an empty scalar empties the zip.
    let mut scalars: Vec<Option<T>> = Vec::with_capacity(n);
    let mut scalar_count = 0usize;
    for source in &self.sources {
      match source {
        Source::Stream(_) => scalars.push(None),
        Source::Scalar(supplier) => match catch_callback(|| supplier()) {
          Err(e) => {
            EmptySubscription::error_to(&subscriber, e);
            return;
          }
          Ok(None) => {
            EmptySubscription::complete_to(&subscriber);
            return;
          }
          Ok(Some(v)) => {
            scalars.push(Some(v));
            scalar_count += 1;
          }
        },
      }
    }

    if scalar_count == n {
      let scalar = Arc::new(DeferredScalar::new(subscriber.clone()));
      subscriber.on_subscribe(Upstream::Fused(scalar.clone()));
      let row: ZipRow<T> = scalars.into_iter().flatten().collect();
      match catch_callback(|| (self.zipper)(row)) {
        Err(e) => subscriber.on_error(e),
        Ok(v) => scalar.complete(v),
      }
      return;
    }

    if scalar_count != 0 {
      let coordinator =
        ZipSingleCoordinator::new(subscriber.clone(), scalars, self.zipper.clone());
      subscriber.on_subscribe(Upstream::Fused(coordinator.clone()));
      coordinator.subscribe(&self.sources);
      return;
    }

    let coordinator = ZipCoordinator::new(
      subscriber.clone(),
      self.zipper.clone(),
      n,
      self.prefetch,
    );
    subscriber.on_subscribe(Upstream::Plain(coordinator.clone()));
    coordinator.subscribe(&self.sources);
  }
}

// ---- mixed scalar/stream fast path ----------------------------------------

struct ZipSingleCoordinator<T, R> {
  scalar: DeferredScalar<R>,
  zipper: Zipper<T, R>,
  slots: Vec<Mutex<Option<T>>>,
  subscribers: Vec<Option<Arc<ZipSingleSubscriber<T, R>>>>,
  /// Slots still missing a value; `<= 0` once terminal.
  missing: AtomicIsize,
}

impl<T, R> ZipSingleCoordinator<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn new(
    actual: Arc<dyn Subscriber<R>>,
    scalars: Vec<Option<T>>,
    zipper: Zipper<T, R>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|me: &Weak<Self>| {
      let subscribers = scalars
        .iter()
        .enumerate()
        .map(|(index, slot)| match slot {
          Some(_) => None,
          None => Some(Arc::new(ZipSingleSubscriber {
            parent: me.clone(),
            index,
            slot: SubscriptionSlot::new(),
            done: AtomicBool::new(false),
          })),
        })
        .collect();
      ZipSingleCoordinator {
        scalar: DeferredScalar::new(actual),
        zipper,
        slots: scalars.into_iter().map(Mutex::new).collect(),
        subscribers,
        missing: AtomicIsize::new(0),
      }
    })
  }

  fn subscribe(&self, sources: &[Source<T>]) {
    let waiting =
      self.subscribers.iter().filter(|s| s.is_some()).count() as isize;
    self.missing.store(waiting, Ordering::Release);
    for (source, subscriber) in sources.iter().zip(&self.subscribers) {
      if self.missing.load(Ordering::Acquire) <= 0
        || self.scalar.is_cancelled()
      {
        break;
      }
      if let (Source::Stream(p), Some(s)) = (source, subscriber) {
        p.subscribe(s.clone());
      }
    }
  }

  fn value(&self, value: T, index: usize) {
    *self.slots[index].lock().unwrap() = Some(value);
    if self.missing.fetch_sub(1, Ordering::AcqRel) == 1 {
      let row: ZipRow<T> = self
        .slots
        .iter()
        .map(|slot| slot.lock().unwrap().take())
        .flatten()
        .collect();
      if row.len() != self.slots.len() {
        return;
      }
      match catch_callback(|| (self.zipper)(row)) {
        Err(e) => self.scalar.downstream().on_error(e),
        Ok(v) => self.scalar.complete(v),
      }
    }
  }

  fn error(&self, error: StreamError, _index: usize) {
    if self.missing.swap(0, Ordering::AcqRel) > 0 {
      self.cancel_all();
      self.scalar.downstream().on_error(error);
    } else {
      on_error_dropped(error);
    }
  }

  fn empty_complete(&self, index: usize) {
    if self.slots[index].lock().unwrap().is_none()
      && self.missing.swap(0, Ordering::AcqRel) > 0
    {
      self.cancel_all();
      self.scalar.downstream().on_complete();
    }
  }

  fn cancel_all(&self) {
    for subscriber in self.subscribers.iter().flatten() {
      subscriber.slot.cancel();
    }
  }
}

impl<T, R> Subscription for ZipSingleCoordinator<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn request(&self, n: u64) { self.scalar.request(n); }

  fn cancel(&self) {
    self.scalar.cancel();
    self.cancel_all();
  }
}

impl<T, R> QueueSubscription<R> for ZipSingleCoordinator<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    self.scalar.request_fusion(mode)
  }

  fn poll(&self) -> Option<R> { self.scalar.poll() }

  fn is_empty(&self) -> bool { self.scalar.is_empty() }

  fn clear(&self) { self.scalar.clear(); }
}

/// Takes exactly one value from a stream source and self-cancels.
struct ZipSingleSubscriber<T, R> {
  parent: Weak<ZipSingleCoordinator<T, R>>,
  index: usize,
  slot: SubscriptionSlot<T>,
  done: AtomicBool,
}

impl<T, R> Subscriber<T> for ZipSingleSubscriber<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if self.slot.set_once(upstream) {
      self.slot.request(UNBOUNDED);
    }
  }

  fn on_next(&self, value: T) {
    if self.done.swap(true, Ordering::AcqRel) {
      return;
    }
    self.slot.cancel();
    let Some(parent) = self.parent.upgrade() else { return };
    parent.value(value, self.index);
  }

  fn on_error(&self, error: StreamError) {
    if self.done.swap(true, Ordering::AcqRel) {
      on_error_dropped(error);
      return;
    }
    let Some(parent) = self.parent.upgrade() else { return };
    parent.error(error, self.index);
  }

  fn on_complete(&self) {
    if self.done.swap(true, Ordering::AcqRel) {
      return;
    }
    let Some(parent) = self.parent.upgrade() else { return };
    parent.empty_complete(self.index);
  }
}

// ---- general path ----------------------------------------------------------

struct ZipCoordinator<T, R> {
  actual: Arc<dyn Subscriber<R>>,
  inners: Vec<Arc<ZipInner<T, R>>>,
  zipper: Zipper<T, R>,
  wip: CachePadded<AtomicUsize>,
  requested: CachePadded<AtomicU64>,
  error: ErrorSlot,
  cancelled: AtomicBool,
}

impl<T, R> ZipCoordinator<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn new(
    actual: Arc<dyn Subscriber<R>>,
    zipper: Zipper<T, R>,
    n: usize,
    prefetch: usize,
  ) -> Arc<Self> {
    Arc::new_cyclic(|me: &Weak<Self>| ZipCoordinator {
      actual,
      inners: (0..n)
        .map(|index| {
          Arc::new(ZipInner {
            parent: me.clone(),
            index,
            prefetch,
            limit: (prefetch - (prefetch >> 2)) as u64,
            slot: SubscriptionSlot::new(),
            queue: OnceLock::new(),
            mode: AtomicU8::new(NORMAL),
            done: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            errored_once: AtomicBool::new(false),
          })
        })
        .collect(),
      zipper,
      wip: CachePadded::new(AtomicUsize::new(0)),
      requested: CachePadded::new(AtomicU64::new(0)),
      error: ErrorSlot::new(),
      cancelled: AtomicBool::new(false),
    })
  }

  fn subscribe(&self, sources: &[Source<T>]) {
    for (source, inner) in sources.iter().zip(&self.inners) {
      if self.cancelled.load(Ordering::Acquire) || self.error.is_pending() {
        return;
      }
      if let Source::Stream(p) = source {
        p.subscribe(inner.clone());
      }
    }
  }

  fn inner_error(&self, error: StreamError) {
    if self.error.record(error.clone()) {
      self.drain();
    } else {
      on_error_dropped(error);
    }
  }

  fn cancel_all(&self) {
    for inner in &self.inners {
      inner.slot.cancel();
    }
  }

  fn terminate_with_error(&self) {
    self.cancel_all();
    if let Some(e) = self.error.take() {
      self.actual.on_error(e);
    }
  }

  fn drain(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      return;
    }

    let n = self.inners.len();
    let mut missed = 1usize;
    loop {
      let r = self.requested.load(Ordering::Acquire);
      let mut e = 0u64;

      'emit: while e != r {
        if self.cancelled.load(Ordering::Acquire) {
          return;
        }
        if self.error.is_pending() {
          self.terminate_with_error();
          return;
        }

        let mut finished = false;
        let mut starved = false;
        for inner in &self.inners {
          let done = inner.done.load(Ordering::Acquire);
          let empty = inner.queue_empty();
          if done && empty {
            finished = true;
            break;
          }
          if empty {
            starved = true;
            break;
          }
        }
        if finished {
          self.cancel_all();
          self.actual.on_complete();
          return;
        }
        if starved {
          break 'emit;
        }

        let mut row: ZipRow<T> = SmallVec::with_capacity(n);
        for inner in &self.inners {
          match inner.poll() {
            Some(v) => row.push(v),
            // Emptiness was checked just above; nothing but this drain
            // pops, so this arm is unreachable in practice.
            None => break 'emit,
          }
        }

        match catch_callback(|| (self.zipper)(row)) {
          Err(ex) => {
            self.cancel_all();
            if !self.error.record(ex.clone()) {
              on_error_dropped(ex);
            }
            self.terminate_with_error();
            return;
          }
          Ok(v) => {
            self.actual.on_next(v);
            e += 1;
          }
        }
      }

      if e == r {
        if self.cancelled.load(Ordering::Acquire) {
          return;
        }
        if self.error.is_pending() {
          self.terminate_with_error();
          return;
        }
        let finished = self.inners.iter().any(|inner| {
          inner.done.load(Ordering::Acquire) && inner.queue_empty()
        });
        if finished {
          self.cancel_all();
          self.actual.on_complete();
          return;
        }
      }

      if e != 0 {
        for inner in &self.inners {
          inner.replenish(e);
        }
        if r != UNBOUNDED {
          self.requested.fetch_sub(e, Ordering::AcqRel);
        }
      }

      let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
      if prev == missed {
        break;
      }
      missed = prev - missed;
    }
  }
}

impl<T, R> Subscription for ZipCoordinator<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      self.inner_error(StreamError::ZeroRequest);
      return;
    }
    add_capped(&self.requested, n);
    self.drain();
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.cancel_all();
    }
  }
}

struct ZipInner<T, R> {
  parent: Weak<ZipCoordinator<T, R>>,
  index: usize,
  prefetch: usize,
  limit: u64,
  slot: SubscriptionSlot<T>,
  queue: OnceLock<OpQueue<T>>,
  mode: AtomicU8,
  done: AtomicBool,
  /// Emissions charged against the upstream window since the last
  /// replenishment; drain-confined.
  produced: AtomicU64,
  errored_once: AtomicBool,
}

impl<T, R> ZipInner<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn poll(&self) -> Option<T> { self.queue.get().and_then(|q| q.poll()) }

  fn queue_empty(&self) -> bool {
    self.queue.get().map(|q| q.is_empty()).unwrap_or(true)
  }

  /// Charges `n` emissions and requests a fresh window once `limit` is
  /// reached. Synchronous fusion needs no replenishment.
  fn replenish(&self, n: u64) {
    if self.mode.load(Ordering::Acquire) == SYNC {
      return;
    }
    let p = self.produced.load(Ordering::Relaxed) + n;
    if p >= self.limit {
      self.produced.store(0, Ordering::Relaxed);
      self.slot.request(p);
    } else {
      self.produced.store(p, Ordering::Relaxed);
    }
  }
}

impl<T, R> Subscriber<T> for ZipInner<T, R>
where
  T: Send + 'static,
  R: Send + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.slot.set_once(upstream.clone()) {
      return;
    }
    if let Upstream::Fused(q) = &upstream {
      match q.request_fusion(FusionMode::Any) {
        FusionMode::Sync => {
          self.mode.store(SYNC, Ordering::Release);
          let _ = self.queue.set(OpQueue::Fused(q.clone()));
          self.done.store(true, Ordering::Release);
          if let Some(parent) = self.parent.upgrade() {
            parent.drain();
          }
          return;
        }
        FusionMode::Async => {
          self.mode.store(ASYNC, Ordering::Release);
          let _ = self.queue.set(OpQueue::Fused(q.clone()));
        }
        _ => {
          let _ = self.queue.set(OpQueue::bounded(self.prefetch));
        }
      }
    } else {
      let _ = self.queue.set(OpQueue::bounded(self.prefetch));
    }
    self.slot.request(self.prefetch as u64);
  }

  fn on_next(&self, value: T) {
    let Some(parent) = self.parent.upgrade() else {
      self.slot.cancel();
      return;
    };
    if self.mode.load(Ordering::Acquire) != ASYNC {
      let rejected = match self.queue.get() {
        Some(q) => q.offer(value).is_err(),
        None => true,
      };
      if rejected {
        self.slot.cancel();
        parent.inner_error(StreamError::QueueFull);
        return;
      }
    }
    parent.drain();
  }

  fn on_error(&self, error: StreamError) {
    if self.mode.load(Ordering::Acquire) == ASYNC
      && self.errored_once.swap(true, Ordering::AcqRel)
    {
      on_error_dropped(error);
      return;
    }
    let Some(parent) = self.parent.upgrade() else { return };
    parent.inner_error(error);
  }

  fn on_complete(&self) {
    self.done.store(true, Ordering::Release);
    let Some(parent) = self.parent.upgrade() else { return };
    parent.drain();
  }

  fn on_poll_ready(&self) {
    if let Some(parent) = self.parent.upgrade() {
      parent.drain();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::source::from_iter;
  use crate::testkit::{Signal, TestPublisher, TestSubscriber};

  fn streams<T: Send + 'static>(
    publishers: Vec<Arc<dyn Publisher<T>>>,
  ) -> Vec<Source<T>> {
    publishers.into_iter().map(Source::Stream).collect()
  }

  #[test]
  fn lockstep_ends_with_the_shortest_source() {
    let a = from_iter(vec!["1", "2", "3"]) as Arc<dyn Publisher<&str>>;
    let b = from_iter(vec!["a", "b"]) as Arc<dyn Publisher<&str>>;
    let ts = TestSubscriber::<String>::new();
    let zip = Zip::new(
      streams(vec![a, b]),
      |row: ZipRow<&str>| format!("{}{}", row[0], row[1]),
      1,
    );
    zip.subscribe(ts.clone());
    assert_eq!(
      ts.signals(),
      vec![
        Signal::Next("1a".to_owned()),
        Signal::Next("2b".to_owned()),
        Signal::Complete
      ]
    );
  }

  #[test]
  fn all_scalar_sources_take_the_single_emission_path() {
    let ts = TestSubscriber::<i32>::with_request(1);
    let zip = Zip::new(
      vec![Source::value(10), Source::value(20)],
      |row: ZipRow<i32>| row.iter().sum::<i32>(),
      16,
    );
    zip.subscribe(ts.clone());
    assert_eq!(ts.signals(), vec![Signal::Next(30), Signal::Complete]);
    assert_eq!(ts.subscribe_count(), 1);
  }

  #[test]
  fn empty_scalar_completes_the_whole_zip() {
    let ts = TestSubscriber::<i32>::new();
    let stream = from_iter(0..10) as Arc<dyn Publisher<i32>>;
    let zip = Zip::new(
      vec![Source::Stream(stream), Source::scalar(|| None)],
      |row: ZipRow<i32>| row.iter().sum::<i32>(),
      16,
    );
    zip.subscribe(ts.clone());
    assert_eq!(ts.signals(), vec![Signal::Complete]);
  }

  #[test]
  fn mixed_scalars_wait_for_every_stream() {
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::new();
    let zip = Zip::new(
      vec![
        Source::value(100),
        Source::Stream(tp.clone() as Arc<dyn Publisher<i32>>),
      ],
      |row: ZipRow<i32>| row.iter().sum::<i32>(),
      16,
    );
    zip.subscribe(ts.clone());
    assert!(ts.signals().is_empty());
    tp.next(7);
    assert_eq!(ts.signals(), vec![Signal::Next(107), Signal::Complete]);
    assert!(tp.is_cancelled());
  }

  #[test]
  fn mixed_path_stream_completing_empty_completes_the_zip() {
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::new();
    let zip = Zip::new(
      vec![
        Source::value(100),
        Source::Stream(tp.clone() as Arc<dyn Publisher<i32>>),
      ],
      |row: ZipRow<i32>| row.iter().sum::<i32>(),
      16,
    );
    zip.subscribe(ts.clone());
    tp.complete();
    assert_eq!(ts.signals(), vec![Signal::Complete]);
  }

  #[test]
  fn first_error_cancels_every_inner() {
    let left = TestPublisher::<i32>::new();
    let right = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::new();
    let zip = Zip::new(
      streams(vec![
        left.clone() as Arc<dyn Publisher<i32>>,
        right.clone() as Arc<dyn Publisher<i32>>,
      ]),
      |row: ZipRow<i32>| row.iter().sum::<i32>(),
      8,
    );
    zip.subscribe(ts.clone());
    left.next(1);
    right.error(StreamError::msg("boom"));
    assert_eq!(ts.error(), Some(StreamError::msg("boom")));
    assert!(left.is_cancelled());
  }

  #[test]
  fn zipper_panic_fails_the_stream() {
    let a = from_iter(0..3) as Arc<dyn Publisher<i32>>;
    let b = from_iter(0..3) as Arc<dyn Publisher<i32>>;
    let ts = TestSubscriber::<i32>::new();
    let zip = Zip::new(
      streams(vec![a, b]),
      |_row: ZipRow<i32>| -> i32 { panic!("bad zipper") },
      4,
    );
    zip.subscribe(ts.clone());
    assert_eq!(
      ts.error(),
      Some(StreamError::Callback("bad zipper".into()))
    );
  }

  #[test]
  fn demand_gates_combined_emissions() {
    let a = from_iter(0..100) as Arc<dyn Publisher<i32>>;
    let b = from_iter(0..100) as Arc<dyn Publisher<i32>>;
    let ts = TestSubscriber::<i32>::with_request(0);
    let zip = Zip::new(
      streams(vec![a, b]),
      |row: ZipRow<i32>| row[0] + row[1],
      8,
    );
    zip.subscribe(ts.clone());
    assert!(ts.values().is_empty());
    ts.request(3);
    assert_eq!(ts.values(), vec![0, 2, 4]);
    assert!(!ts.is_terminated());
    ts.request(UNBOUNDED);
    assert_eq!(ts.values().len(), 100);
    assert!(ts.is_complete());
  }

  #[test]
  fn no_sources_means_immediate_completion() {
    let ts = TestSubscriber::<i32>::new();
    let zip =
      Zip::new(Vec::<Source<i32>>::new(), |row: ZipRow<i32>| row[0], 4);
    zip.subscribe(ts.clone());
    assert_eq!(ts.signals(), vec![Signal::Complete]);
  }

  #[test]
  fn cancel_reaches_all_inners() {
    let left = TestPublisher::<i32>::new();
    let right = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::new();
    let zip = Zip::new(
      streams(vec![
        left.clone() as Arc<dyn Publisher<i32>>,
        right.clone() as Arc<dyn Publisher<i32>>,
      ]),
      |row: ZipRow<i32>| row[0] + row[1],
      8,
    );
    zip.subscribe(ts.clone());
    ts.cancel();
    assert!(left.is_cancelled());
    assert!(right.is_cancelled());
    left.next(1);
    right.next(2);
    assert!(ts.values().is_empty());
  }
}
