//! Test instruments: a recording subscriber, a manually driven publisher
//! and a demand probe. Public so downstream crates can assert protocol
//! behavior the same way this crate's own tests do.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::demand::{add_capped, UNBOUNDED};
use crate::error::StreamError;
use crate::publisher::Publisher;
use crate::subscriber::{ConditionalSubscriber, Subscriber};
use crate::subscription::{Subscription, Upstream};

/// One observed downstream signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
  Next(T),
  Error(StreamError),
  Complete,
}

struct Recording<T> {
  signals: Vec<Signal<T>>,
  upstream: Option<Upstream<T>>,
  subscribe_calls: usize,
  terminated: bool,
}

/// Records every signal it observes and lets tests issue demand, cancel and
/// wait for progress with a deadline.
pub struct TestSubscriber<T> {
  recording: Mutex<Recording<T>>,
  progress: Condvar,
  poll_ready: AtomicUsize,
  auto_request: u64,
}

impl<T: Send + 'static> TestSubscriber<T> {
  /// A subscriber that immediately requests unbounded demand.
  pub fn new() -> Arc<Self> { Self::with_request(UNBOUNDED) }

  /// A subscriber that requests `n` on subscribe (`0` requests nothing).
  pub fn with_request(n: u64) -> Arc<Self> {
    Arc::new(TestSubscriber {
      recording: Mutex::new(Recording {
        signals: Vec::new(),
        upstream: None,
        subscribe_calls: 0,
        terminated: false,
      }),
      progress: Condvar::new(),
      poll_ready: AtomicUsize::new(0),
      auto_request: n,
    })
  }

  pub fn signals(&self) -> Vec<Signal<T>>
  where
    T: Clone,
  {
    self.recording.lock().unwrap().signals.clone()
  }

  /// The `on_next` payloads observed so far, in order.
  pub fn values(&self) -> Vec<T>
  where
    T: Clone,
  {
    self
      .recording
      .lock()
      .unwrap()
      .signals
      .iter()
      .filter_map(|s| match s {
        Signal::Next(v) => Some(v.clone()),
        _ => None,
      })
      .collect()
  }

  pub fn error(&self) -> Option<StreamError> {
    self
      .recording
      .lock()
      .unwrap()
      .signals
      .iter()
      .find_map(|s| match s {
        Signal::Error(e) => Some(e.clone()),
        _ => None,
      })
  }

  pub fn is_complete(&self) -> bool {
    self
      .recording
      .lock()
      .unwrap()
      .signals
      .iter()
      .any(|s| matches!(s, Signal::Complete))
  }

  pub fn is_terminated(&self) -> bool {
    self.recording.lock().unwrap().terminated
  }

  pub fn terminal_count(&self) -> usize {
    self
      .recording
      .lock()
      .unwrap()
      .signals
      .iter()
      .filter(|s| !matches!(s, Signal::Next(_)))
      .count()
  }

  pub fn subscribe_count(&self) -> usize {
    self.recording.lock().unwrap().subscribe_calls
  }

  pub fn poll_ready_count(&self) -> usize {
    self.poll_ready.load(Ordering::SeqCst)
  }

  /// Issues demand through the recorded upstream.
  pub fn request(&self, n: u64) {
    let upstream = self.recording.lock().unwrap().upstream.clone();
    if let Some(up) = upstream {
      up.request(n);
    }
  }

  pub fn cancel(&self) {
    let upstream = self.recording.lock().unwrap().upstream.clone();
    if let Some(up) = upstream {
      up.cancel();
    }
  }

  /// Waits until a terminal signal arrives. Returns `false` on timeout.
  pub fn await_terminal(&self, timeout: Duration) -> bool {
    self.await_while(timeout, |r| !r.terminated)
  }

  /// Waits until at least `n` items arrived. Returns `false` on timeout.
  pub fn await_items(&self, n: usize, timeout: Duration) -> bool {
    self.await_while(timeout, |r| {
      r.signals.iter().filter(|s| matches!(s, Signal::Next(_))).count() < n
    })
  }

  fn await_while(
    &self,
    timeout: Duration,
    keep_waiting: impl Fn(&Recording<T>) -> bool,
  ) -> bool {
    let deadline = Instant::now() + timeout;
    let mut recording = self.recording.lock().unwrap();
    while keep_waiting(&recording) {
      let Some(left) = deadline.checked_duration_since(Instant::now()) else {
        return false;
      };
      let (guard, wait) =
        self.progress.wait_timeout(recording, left).unwrap();
      recording = guard;
      if wait.timed_out() && keep_waiting(&recording) {
        return false;
      }
    }
    true
  }

  fn record(&self, signal: Signal<T>) {
    let mut recording = self.recording.lock().unwrap();
    if !matches!(signal, Signal::Next(_)) {
      recording.terminated = true;
    }
    recording.signals.push(signal);
    drop(recording);
    self.progress.notify_all();
  }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    {
      let mut recording = self.recording.lock().unwrap();
      recording.subscribe_calls += 1;
      recording.upstream = Some(upstream.clone());
    }
    if self.auto_request != 0 {
      upstream.request(self.auto_request);
    }
  }

  fn on_next(&self, value: T) { self.record(Signal::Next(value)); }

  fn on_error(&self, error: StreamError) {
    self.record(Signal::Error(error));
  }

  fn on_complete(&self) { self.record(Signal::Complete); }

  fn on_poll_ready(&self) {
    self.poll_ready.fetch_add(1, Ordering::SeqCst);
  }
}

/// A recording subscriber whose `try_on_next` consults a predicate;
/// declined values are counted instead of recorded.
pub struct TestConditionalSubscriber<T> {
  base: Arc<TestSubscriber<T>>,
  accept: Box<dyn Fn(&T) -> bool + Send + Sync>,
  rejected: AtomicUsize,
}

impl<T: Send + 'static> TestConditionalSubscriber<T> {
  pub fn new(
    request: u64,
    accept: impl Fn(&T) -> bool + Send + Sync + 'static,
  ) -> Arc<Self> {
    Arc::new(TestConditionalSubscriber {
      base: TestSubscriber::with_request(request),
      accept: Box::new(accept),
      rejected: AtomicUsize::new(0),
    })
  }

  pub fn base(&self) -> &Arc<TestSubscriber<T>> { &self.base }

  pub fn rejected_count(&self) -> usize {
    self.rejected.load(Ordering::SeqCst)
  }
}

impl<T: Send + 'static> Subscriber<T> for TestConditionalSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    self.base.on_subscribe(upstream);
  }

  fn on_next(&self, value: T) { self.base.on_next(value); }

  fn on_error(&self, error: StreamError) { self.base.on_error(error); }

  fn on_complete(&self) { self.base.on_complete(); }

  fn on_poll_ready(&self) { self.base.on_poll_ready(); }
}

impl<T: Send + 'static> ConditionalSubscriber<T>
  for TestConditionalSubscriber<T>
{
  fn try_on_next(&self, value: T) -> bool {
    if (self.accept)(&value) {
      self.base.on_next(value);
      true
    } else {
      self.rejected.fetch_add(1, Ordering::SeqCst);
      false
    }
  }
}

struct ManualSubscription {
  requested: Arc<AtomicU64>,
  cancelled: Arc<AtomicBool>,
}

impl Subscription for ManualSubscription {
  fn request(&self, n: u64) { add_capped(&self.requested, n); }

  fn cancel(&self) { self.cancelled.store(true, Ordering::SeqCst); }
}

/// A publisher driven by hand. It records the demand it was given but does
/// not enforce it, so misbehaving-producer paths can be exercised too.
pub struct TestPublisher<T> {
  subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
  requested: Arc<AtomicU64>,
  cancelled: Arc<AtomicBool>,
}

impl<T: Send + 'static> TestPublisher<T> {
  pub fn new() -> Arc<Self> {
    Arc::new(TestPublisher {
      subscriber: Mutex::new(None),
      requested: Arc::new(AtomicU64::new(0)),
      cancelled: Arc::new(AtomicBool::new(false)),
    })
  }

  fn target(&self) -> Option<Arc<dyn Subscriber<T>>> {
    self.subscriber.lock().unwrap().clone()
  }

  pub fn next(&self, value: T) {
    if let Some(s) = self.target() {
      s.on_next(value);
    }
  }

  pub fn error(&self, error: StreamError) {
    if let Some(s) = self.target() {
      s.on_error(error);
    }
  }

  pub fn complete(&self) {
    if let Some(s) = self.target() {
      s.on_complete();
    }
  }

  /// Cumulative demand observed from the subscriber side.
  pub fn requested(&self) -> u64 {
    self.requested.load(Ordering::SeqCst)
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  pub fn has_subscriber(&self) -> bool {
    self.subscriber.lock().unwrap().is_some()
  }
}

impl<T: Send + 'static> Publisher<T> for TestPublisher<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    *self.subscriber.lock().unwrap() = Some(subscriber.clone());
    let subscription = Arc::new(ManualSubscription {
      requested: self.requested.clone(),
      cancelled: self.cancelled.clone(),
    });
    subscriber.on_subscribe(Upstream::Plain(subscription));
  }
}

/// A bare subscription that records demand and cancellation.
pub struct ProbeSubscription {
  requested: AtomicU64,
  cancelled: AtomicBool,
}

impl ProbeSubscription {
  pub fn new() -> Arc<Self> {
    Arc::new(ProbeSubscription {
      requested: AtomicU64::new(0),
      cancelled: AtomicBool::new(false),
    })
  }

  pub fn requested(&self) -> u64 {
    self.requested.load(Ordering::SeqCst)
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

impl Subscription for ProbeSubscription {
  fn request(&self, n: u64) { add_capped(&self.requested, n); }

  fn cancel(&self) { self.cancelled.store(true, Ordering::SeqCst); }
}
