//! Moves emission from the upstream's thread onto a scheduler worker,
//! buffering up to `prefetch` items across the boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_utils::CachePadded;

use crate::demand::{self, add_capped, UNBOUNDED};
use crate::error::{on_error_dropped, ErrorSlot, StreamError};
use crate::fusion::FusionMode;
use crate::publisher::Publisher;
use crate::queue::OpQueue;
use crate::scheduler::{Scheduler, Task, Worker};
use crate::subscriber::{ConditionalSubscriber, Subscriber};
use crate::subscription::{Subscription, Upstream};

/// Default prefetch window across the asynchronous boundary.
pub const DEFAULT_PREFETCH: usize = 128;

const NORMAL: u8 = 0;
const SYNC: u8 = 1;
const ASYNC: u8 = 2;

#[inline]
fn limit_for(prefetch: usize) -> u64 {
  if prefetch == usize::MAX {
    u64::MAX
  } else {
    (prefetch - (prefetch >> 2)) as u64
  }
}

/// The asynchronous boundary operator.
pub struct ObserveOn<T> {
  source: Arc<dyn Publisher<T>>,
  scheduler: Arc<dyn Scheduler>,
  delay_error: bool,
  prefetch: usize,
}

impl<T: Send + 'static> ObserveOn<T> {
  pub fn new(
    source: Arc<dyn Publisher<T>>,
    scheduler: Arc<dyn Scheduler>,
  ) -> Self {
    Self::with(source, scheduler, false, DEFAULT_PREFETCH)
  }

  /// `delay_error` holds an upstream error back until every already
  /// buffered item has been delivered. `prefetch == usize::MAX` requests
  /// unbounded demand and buffers without bound.
  pub fn with(
    source: Arc<dyn Publisher<T>>,
    scheduler: Arc<dyn Scheduler>,
    delay_error: bool,
    prefetch: usize,
  ) -> Self {
    assert!(prefetch > 0, "prefetch > 0 required but it was {prefetch}");
    ObserveOn { source, scheduler, delay_error, prefetch }
  }
}

impl<T: Send + 'static> Publisher<T> for ObserveOn<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let worker = self.scheduler.create_worker();
    let boundary = Arc::new_cyclic(|me| ObserveOnSubscriber {
      actual: subscriber,
      worker,
      delay_error: self.delay_error,
      prefetch: self.prefetch,
      limit: limit_for(self.prefetch),
      hook: OnceLock::new(),
      wip: CachePadded::new(AtomicUsize::new(0)),
      requested: CachePadded::new(AtomicU64::new(0)),
      done: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      terminated: AtomicBool::new(false),
      error: ErrorSlot::new(),
      emitted: AtomicU64::new(0),
      me: me.clone(),
    });
    self.source.subscribe(boundary);
  }

  fn subscribe_conditional(
    &self,
    subscriber: Arc<dyn ConditionalSubscriber<T>>,
  ) {
    let worker = self.scheduler.create_worker();
    let boundary = Arc::new_cyclic(|me| ObserveOnConditionalSubscriber {
      actual: subscriber,
      worker,
      delay_error: self.delay_error,
      prefetch: self.prefetch,
      limit: limit_for(self.prefetch),
      hook: OnceLock::new(),
      wip: CachePadded::new(AtomicUsize::new(0)),
      requested: CachePadded::new(AtomicU64::new(0)),
      done: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      terminated: AtomicBool::new(false),
      error: ErrorSlot::new(),
      emitted: AtomicU64::new(0),
      polled: AtomicU64::new(0),
      me: me.clone(),
    });
    self.source.subscribe(boundary);
  }
}

struct Hookup<T> {
  upstream: Upstream<T>,
  queue: OpQueue<T>,
  mode: u8,
}

struct ObserveOnSubscriber<T> {
  actual: Arc<dyn Subscriber<T>>,
  worker: Arc<dyn Worker>,
  delay_error: bool,
  prefetch: usize,
  limit: u64,
  hook: OnceLock<Hookup<T>>,
  wip: CachePadded<AtomicUsize>,
  requested: CachePadded<AtomicU64>,
  done: AtomicBool,
  cancelled: AtomicBool,
  terminated: AtomicBool,
  error: ErrorSlot,
  // Carry-over of the drain position between drain invocations; only the
  // drain owner touches it.
  emitted: AtomicU64,
  me: Weak<ObserveOnSubscriber<T>>,
}

impl<T: Send + 'static> ObserveOnSubscriber<T> {
  fn owned_queue(&self) -> OpQueue<T> {
    if self.prefetch == usize::MAX {
      OpQueue::unbounded()
    } else {
      OpQueue::bounded(self.prefetch)
    }
  }

  fn record_error(&self, error: StreamError) {
    if !self.error.record(error.clone()) {
      on_error_dropped(error);
    }
  }

  fn try_schedule(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    let task: Task = Box::new(move || me.drain());
    if self.worker.schedule(task).is_err() {
      if self.cancelled.load(Ordering::Acquire)
        || self.terminated.swap(true, Ordering::AcqRel)
      {
        on_error_dropped(StreamError::SchedulerRejected);
        return;
      }
      if let Some(hook) = self.hook.get() {
        hook.upstream.cancel();
        hook.queue.clear();
      }
      self.actual.on_error(StreamError::SchedulerRejected);
    }
  }

  fn drain(&self) {
    let Some(hook) = self.hook.get() else { return };
    if hook.mode == SYNC {
      self.run_sync(hook);
    } else {
      self.run_async(hook);
    }
  }

  fn run_sync(&self, hook: &Hookup<T>) {
    let mut missed = 1usize;
    let mut e = self.emitted.load(Ordering::Relaxed);
    loop {
      let r = self.requested.load(Ordering::Acquire);
      while e != r {
        let v = hook.queue.poll();
        if self.cancelled.load(Ordering::Acquire) {
          self.worker.shutdown();
          return;
        }
        match v {
          None => {
            self.worker.shutdown();
            self.terminated.store(true, Ordering::Release);
            self.actual.on_complete();
            return;
          }
          Some(v) => {
            self.actual.on_next(v);
            e += 1;
          }
        }
      }
      if self.cancelled.load(Ordering::Acquire) {
        self.worker.shutdown();
        return;
      }
      if hook.queue.is_empty() {
        self.worker.shutdown();
        self.terminated.store(true, Ordering::Release);
        self.actual.on_complete();
        return;
      }
      let w = self.wip.load(Ordering::Acquire);
      if missed == w {
        self.emitted.store(e, Ordering::Relaxed);
        let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
        if prev == missed {
          break;
        }
        missed = prev - missed;
      } else {
        missed = w;
      }
    }
  }

  fn run_async(&self, hook: &Hookup<T>) {
    let mut missed = 1usize;
    let mut e = self.emitted.load(Ordering::Relaxed);
    loop {
      let mut r = self.requested.load(Ordering::Acquire);
      while e != r {
        let d = self.done.load(Ordering::Acquire);
        let v = hook.queue.poll();
        let empty = v.is_none();
        if self.check_terminated(d, empty, hook) {
          return;
        }
        let Some(v) = v else { break };
        self.actual.on_next(v);
        e += 1;
        if e == self.limit {
          if r != UNBOUNDED {
            r = self.requested.fetch_sub(e, Ordering::AcqRel) - e;
          }
          hook.upstream.request(e);
          e = 0;
        }
      }
      if e == r {
        let d = self.done.load(Ordering::Acquire);
        let empty = hook.queue.is_empty();
        if self.check_terminated(d, empty, hook) {
          return;
        }
      }
      let w = self.wip.load(Ordering::Acquire);
      if missed == w {
        self.emitted.store(e, Ordering::Relaxed);
        let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
        if prev == missed {
          break;
        }
        missed = prev - missed;
      } else {
        missed = w;
      }
    }
  }

  fn check_terminated(&self, d: bool, empty: bool, hook: &Hookup<T>) -> bool {
    if self.cancelled.load(Ordering::Acquire) {
      hook.upstream.cancel();
      self.worker.shutdown();
      hook.queue.clear();
      return true;
    }
    if d {
      if self.delay_error {
        if empty {
          self.worker.shutdown();
          self.terminated.store(true, Ordering::Release);
          match self.error.take() {
            Some(e) => self.actual.on_error(e),
            None => self.actual.on_complete(),
          }
          return true;
        }
      } else if self.error.is_pending() {
        self.worker.shutdown();
        hook.queue.clear();
        self.terminated.store(true, Ordering::Release);
        if let Some(e) = self.error.take() {
          self.actual.on_error(e);
        }
        return true;
      } else if empty {
        self.worker.shutdown();
        self.terminated.store(true, Ordering::Release);
        self.actual.on_complete();
        return true;
      }
    }
    false
  }
}

impl<T: Send + 'static> Subscriber<T> for ObserveOnSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    let mut mode = NORMAL;
    let queue = match &upstream {
      Upstream::Fused(q) => match q.request_fusion(FusionMode::Any) {
        FusionMode::Sync => {
          mode = SYNC;
          self.done.store(true, Ordering::Release);
          OpQueue::Fused(q.clone())
        }
        FusionMode::Async => {
          mode = ASYNC;
          OpQueue::Fused(q.clone())
        }
        _ => self.owned_queue(),
      },
      Upstream::Plain(_) => self.owned_queue(),
    };
    let up = upstream.clone();
    if self.hook.set(Hookup { upstream, queue, mode }).is_err() {
      up.cancel();
      on_error_dropped(StreamError::DuplicateSubscription);
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    self.actual.on_subscribe(Upstream::Plain(me));
    if mode != SYNC {
      let n = if self.prefetch == usize::MAX {
        UNBOUNDED
      } else {
        self.prefetch as u64
      };
      up.request(n);
    }
  }

  fn on_next(&self, value: T) {
    let Some(hook) = self.hook.get() else { return };
    if hook.mode == ASYNC {
      self.try_schedule();
      return;
    }
    if hook.queue.offer(value).is_err() {
      hook.upstream.cancel();
      self.record_error(StreamError::QueueFull);
      self.done.store(true, Ordering::Release);
    }
    self.try_schedule();
  }

  fn on_error(&self, error: StreamError) {
    self.record_error(error);
    self.done.store(true, Ordering::Release);
    self.try_schedule();
  }

  fn on_complete(&self) {
    self.done.store(true, Ordering::Release);
    self.try_schedule();
  }

  fn on_poll_ready(&self) { self.try_schedule(); }
}

impl<T: Send + 'static> Subscription for ObserveOnSubscriber<T> {
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      self.record_error(StreamError::ZeroRequest);
      self.done.store(true, Ordering::Release);
      self.try_schedule();
      return;
    }
    add_capped(&self.requested, n);
    self.try_schedule();
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.worker.shutdown();
    // The drain task may have been disposed together with the worker, so
    // upstream cancellation cannot be left to it.
    if let Some(hook) = self.hook.get() {
      hook.upstream.cancel();
    }
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      if let Some(hook) = self.hook.get() {
        hook.queue.clear();
      }
    }
  }
}

struct ObserveOnConditionalSubscriber<T> {
  actual: Arc<dyn ConditionalSubscriber<T>>,
  worker: Arc<dyn Worker>,
  delay_error: bool,
  prefetch: usize,
  limit: u64,
  hook: OnceLock<Hookup<T>>,
  wip: CachePadded<AtomicUsize>,
  requested: CachePadded<AtomicU64>,
  done: AtomicBool,
  cancelled: AtomicBool,
  terminated: AtomicBool,
  error: ErrorSlot,
  emitted: AtomicU64,
  // Items taken from the queue regardless of acceptance; drives
  // replenishment.
  polled: AtomicU64,
  me: Weak<ObserveOnConditionalSubscriber<T>>,
}

impl<T: Send + 'static> ObserveOnConditionalSubscriber<T> {
  fn owned_queue(&self) -> OpQueue<T> {
    if self.prefetch == usize::MAX {
      OpQueue::unbounded()
    } else {
      OpQueue::bounded(self.prefetch)
    }
  }

  fn record_error(&self, error: StreamError) {
    if !self.error.record(error.clone()) {
      on_error_dropped(error);
    }
  }

  fn try_schedule(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    let task: Task = Box::new(move || me.drain());
    if self.worker.schedule(task).is_err() {
      if self.cancelled.load(Ordering::Acquire)
        || self.terminated.swap(true, Ordering::AcqRel)
      {
        on_error_dropped(StreamError::SchedulerRejected);
        return;
      }
      if let Some(hook) = self.hook.get() {
        hook.upstream.cancel();
        hook.queue.clear();
      }
      self.actual.on_error(StreamError::SchedulerRejected);
    }
  }

  fn drain(&self) {
    let Some(hook) = self.hook.get() else { return };
    if hook.mode == SYNC {
      self.run_sync(hook);
    } else {
      self.run_async(hook);
    }
  }

  fn run_sync(&self, hook: &Hookup<T>) {
    let mut missed = 1usize;
    let mut e = self.emitted.load(Ordering::Relaxed);
    loop {
      let r = self.requested.load(Ordering::Acquire);
      while e != r {
        let v = hook.queue.poll();
        if self.cancelled.load(Ordering::Acquire) {
          self.worker.shutdown();
          return;
        }
        match v {
          None => {
            self.worker.shutdown();
            self.terminated.store(true, Ordering::Release);
            self.actual.on_complete();
            return;
          }
          Some(v) => {
            if self.actual.try_on_next(v) {
              e += 1;
            }
          }
        }
      }
      if self.cancelled.load(Ordering::Acquire) {
        self.worker.shutdown();
        return;
      }
      if hook.queue.is_empty() {
        self.worker.shutdown();
        self.terminated.store(true, Ordering::Release);
        self.actual.on_complete();
        return;
      }
      let w = self.wip.load(Ordering::Acquire);
      if missed == w {
        self.emitted.store(e, Ordering::Relaxed);
        let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
        if prev == missed {
          break;
        }
        missed = prev - missed;
      } else {
        missed = w;
      }
    }
  }

  fn run_async(&self, hook: &Hookup<T>) {
    let mut missed = 1usize;
    let mut emitted = self.emitted.load(Ordering::Relaxed);
    let mut polled = self.polled.load(Ordering::Relaxed);
    loop {
      let r = self.requested.load(Ordering::Acquire);
      while emitted != r {
        let d = self.done.load(Ordering::Acquire);
        let v = hook.queue.poll();
        let empty = v.is_none();
        if self.check_terminated(d, empty, hook) {
          return;
        }
        let Some(v) = v else { break };
        if self.actual.try_on_next(v) {
          emitted += 1;
        }
        polled += 1;
        if polled == self.limit {
          hook.upstream.request(polled);
          polled = 0;
        }
      }
      if emitted == r {
        let d = self.done.load(Ordering::Acquire);
        let empty = hook.queue.is_empty();
        if self.check_terminated(d, empty, hook) {
          return;
        }
      }
      let w = self.wip.load(Ordering::Acquire);
      if missed == w {
        self.emitted.store(emitted, Ordering::Relaxed);
        self.polled.store(polled, Ordering::Relaxed);
        let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
        if prev == missed {
          break;
        }
        missed = prev - missed;
      } else {
        missed = w;
      }
    }
  }

  fn check_terminated(&self, d: bool, empty: bool, hook: &Hookup<T>) -> bool {
    if self.cancelled.load(Ordering::Acquire) {
      hook.upstream.cancel();
      self.worker.shutdown();
      hook.queue.clear();
      return true;
    }
    if d {
      if self.delay_error {
        if empty {
          self.worker.shutdown();
          self.terminated.store(true, Ordering::Release);
          match self.error.take() {
            Some(e) => self.actual.on_error(e),
            None => self.actual.on_complete(),
          }
          return true;
        }
      } else if self.error.is_pending() {
        self.worker.shutdown();
        hook.queue.clear();
        self.terminated.store(true, Ordering::Release);
        if let Some(e) = self.error.take() {
          self.actual.on_error(e);
        }
        return true;
      } else if empty {
        self.worker.shutdown();
        self.terminated.store(true, Ordering::Release);
        self.actual.on_complete();
        return true;
      }
    }
    false
  }
}

impl<T: Send + 'static> Subscriber<T> for ObserveOnConditionalSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    let mut mode = NORMAL;
    let queue = match &upstream {
      Upstream::Fused(q) => match q.request_fusion(FusionMode::Any) {
        FusionMode::Sync => {
          mode = SYNC;
          self.done.store(true, Ordering::Release);
          OpQueue::Fused(q.clone())
        }
        FusionMode::Async => {
          mode = ASYNC;
          OpQueue::Fused(q.clone())
        }
        _ => self.owned_queue(),
      },
      Upstream::Plain(_) => self.owned_queue(),
    };
    let up = upstream.clone();
    if self.hook.set(Hookup { upstream, queue, mode }).is_err() {
      up.cancel();
      on_error_dropped(StreamError::DuplicateSubscription);
      return;
    }
    let Some(me) = self.me.upgrade() else { return };
    self.actual.on_subscribe(Upstream::Plain(me));
    if mode != SYNC {
      let n = if self.prefetch == usize::MAX {
        UNBOUNDED
      } else {
        self.prefetch as u64
      };
      up.request(n);
    }
  }

  fn on_next(&self, value: T) {
    let Some(hook) = self.hook.get() else { return };
    if hook.mode == ASYNC {
      self.try_schedule();
      return;
    }
    if hook.queue.offer(value).is_err() {
      hook.upstream.cancel();
      self.record_error(StreamError::QueueFull);
      self.done.store(true, Ordering::Release);
    }
    self.try_schedule();
  }

  fn on_error(&self, error: StreamError) {
    self.record_error(error);
    self.done.store(true, Ordering::Release);
    self.try_schedule();
  }

  fn on_complete(&self) {
    self.done.store(true, Ordering::Release);
    self.try_schedule();
  }

  fn on_poll_ready(&self) { self.try_schedule(); }
}

impl<T: Send + 'static> Subscription for ObserveOnConditionalSubscriber<T> {
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      self.record_error(StreamError::ZeroRequest);
      self.done.store(true, Ordering::Release);
      self.try_schedule();
      return;
    }
    add_capped(&self.requested, n);
    self.try_schedule();
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.worker.shutdown();
    // The drain task may have been disposed together with the worker, so
    // upstream cancellation cannot be left to it.
    if let Some(hook) = self.hook.get() {
      hook.upstream.cancel();
    }
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      if let Some(hook) = self.hook.get() {
        hook.queue.clear();
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::source::from_iter;
  use crate::testkit::{Signal, TestConditionalSubscriber, TestPublisher,
                       TestSubscriber};
  use std::time::Duration;

  const WAIT: Duration = Duration::from_secs(5);

  fn scheduler() -> Arc<dyn Scheduler> {
    Arc::new(crate::scheduler::CachedThreadScheduler::new())
  }

  #[test]
  fn sync_fused_source_is_delivered_in_order() {
    let sd = scheduler();
    let ts = TestSubscriber::<i32>::new();
    let source = from_iter(0..100) as Arc<dyn Publisher<i32>>;
    let op = ObserveOn::new(source, sd.clone());
    op.subscribe(ts.clone());
    assert!(ts.await_terminal(WAIT));
    assert_eq!(ts.values(), (0..100).collect::<Vec<_>>());
    assert!(ts.is_complete());
    sd.shutdown();
  }

  #[test]
  fn async_path_preserves_order_and_completion() {
    let sd = scheduler();
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::new();
    let op = ObserveOn::with(
      tp.clone() as Arc<dyn Publisher<i32>>,
      sd.clone(),
      false,
      8,
    );
    op.subscribe(ts.clone());
    assert_eq!(tp.requested(), 8);
    tp.next(1);
    tp.next(2);
    tp.next(3);
    tp.complete();
    assert!(ts.await_terminal(WAIT));
    assert_eq!(ts.values(), vec![1, 2, 3]);
    assert!(ts.is_complete());
    sd.shutdown();
  }

  #[test]
  fn emission_is_gated_by_downstream_demand() {
    let sd = scheduler();
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::with_request(0);
    let op = ObserveOn::with(
      tp.clone() as Arc<dyn Publisher<i32>>,
      sd.clone(),
      false,
      16,
    );
    op.subscribe(ts.clone());
    for i in 0..5 {
      tp.next(i);
    }
    tp.complete();
    assert!(ts.values().is_empty());

    ts.request(2);
    assert!(ts.await_items(2, WAIT));
    assert_eq!(ts.values(), vec![0, 1]);
    assert!(!ts.is_terminated());

    ts.request(UNBOUNDED);
    assert!(ts.await_terminal(WAIT));
    assert_eq!(ts.values(), vec![0, 1, 2, 3, 4]);
    sd.shutdown();
  }

  #[test]
  fn overflowing_the_prefetch_queue_fails_the_stream() {
    let sd = scheduler();
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::with_request(0);
    let op = ObserveOn::with(
      tp.clone() as Arc<dyn Publisher<i32>>,
      sd.clone(),
      false,
      2,
    );
    op.subscribe(ts.clone());
    tp.next(1);
    tp.next(2);
    tp.next(3);
    assert!(ts.await_terminal(WAIT));
    assert_eq!(ts.error(), Some(StreamError::QueueFull));
    assert!(tp.is_cancelled());
    sd.shutdown();
  }

  #[test]
  fn delayed_error_waits_for_the_buffer_to_drain() {
    let sd = scheduler();
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::with_request(0);
    let op = ObserveOn::with(
      tp.clone() as Arc<dyn Publisher<i32>>,
      sd.clone(),
      true,
      8,
    );
    op.subscribe(ts.clone());
    tp.next(1);
    tp.next(2);
    tp.error(StreamError::msg("boom"));
    ts.request(UNBOUNDED);
    assert!(ts.await_terminal(WAIT));
    assert_eq!(
      ts.signals(),
      vec![
        Signal::Next(1),
        Signal::Next(2),
        Signal::Error(StreamError::msg("boom"))
      ]
    );
    sd.shutdown();
  }

  #[test]
  fn conditional_downstream_drops_without_spending_demand() {
    let sd = scheduler();
    let tcs = TestConditionalSubscriber::<i32>::new(UNBOUNDED, |v| v % 2 == 0);
    let op =
      ObserveOn::new(from_iter(0..10) as Arc<dyn Publisher<i32>>, sd.clone());
    op.subscribe_conditional(tcs.clone());
    assert!(tcs.base().await_terminal(WAIT));
    assert_eq!(tcs.base().values(), vec![0, 2, 4, 6, 8]);
    assert_eq!(tcs.rejected_count(), 5);
    assert!(tcs.base().is_complete());
    sd.shutdown();
  }

  #[test]
  fn rejected_drain_submission_is_terminal() {
    let sd = scheduler();
    sd.shutdown();
    let ts = TestSubscriber::<i32>::new();
    let op = ObserveOn::new(from_iter(0..10) as Arc<dyn Publisher<i32>>, sd);
    op.subscribe(ts.clone());
    assert_eq!(ts.error(), Some(StreamError::SchedulerRejected));
  }

  #[test]
  fn cancel_stops_delivery_and_releases_the_worker() {
    let sd = scheduler();
    let tp = TestPublisher::<i32>::new();
    let ts = TestSubscriber::<i32>::with_request(0);
    let op = ObserveOn::with(
      tp.clone() as Arc<dyn Publisher<i32>>,
      sd.clone(),
      false,
      8,
    );
    op.subscribe(ts.clone());
    tp.next(1);
    ts.cancel();
    assert!(tp.is_cancelled());
    ts.request(5);
    assert!(!ts.await_items(1, Duration::from_millis(200)));
    assert!(ts.signals().is_empty());
    sd.shutdown();
  }
}
