//! Correlates two streams by the lifetime of their values: every left value
//! opens a window, every right value likewise, and each live overlap emits
//! one combined result. Emission order across sides is not guaranteed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

use crate::demand::{self, add_capped, produced, UNBOUNDED};
use crate::error::{catch_callback, on_error_dropped, ErrorSlot, StreamError};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, SubscriptionSlot, Upstream};

/// Returns the window publisher for a value; the window closes on its first
/// emission or on completion.
pub type WindowFn<V> = Arc<dyn Fn(&V) -> Arc<dyn Publisher<()>> + Send + Sync>;

/// Combines one live left value with one live right value.
pub type JoinSelector<L, R, O> = Arc<dyn Fn(&L, &R) -> O + Send + Sync>;

/// The time-overlap correlation operator.
pub struct Join<L, R, O> {
  left: Arc<dyn Publisher<L>>,
  right: Arc<dyn Publisher<R>>,
  left_end: WindowFn<L>,
  right_end: WindowFn<R>,
  selector: JoinSelector<L, R, O>,
}

impl<L, R, O> Join<L, R, O>
where
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  pub fn new(
    left: Arc<dyn Publisher<L>>,
    right: Arc<dyn Publisher<R>>,
    left_end: impl Fn(&L) -> Arc<dyn Publisher<()>> + Send + Sync + 'static,
    right_end: impl Fn(&R) -> Arc<dyn Publisher<()>> + Send + Sync + 'static,
    selector: impl Fn(&L, &R) -> O + Send + Sync + 'static,
  ) -> Self {
    Join {
      left,
      right,
      left_end: Arc::new(left_end),
      right_end: Arc::new(right_end),
      selector: Arc::new(selector),
    }
  }
}

impl<L, R, O> Publisher<O> for Join<L, R, O>
where
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
    let coordinator = Arc::new_cyclic(|me: &Weak<JoinCoordinator<L, R, O>>| {
      JoinCoordinator {
        actual: subscriber.clone(),
        queue: SegQueue::new(),
        left_end: self.left_end.clone(),
        right_end: self.right_end.clone(),
        selector: self.selector.clone(),
        lefts: Mutex::new(BTreeMap::new()),
        rights: Mutex::new(BTreeMap::new()),
        ends: Mutex::new(HashMap::new()),
        left_half: OnceLock::new(),
        right_half: OnceLock::new(),
        wip: CachePadded::new(AtomicUsize::new(0)),
        requested: CachePadded::new(AtomicU64::new(0)),
        active: AtomicUsize::new(2),
        error: ErrorSlot::new(),
        cancelled: AtomicBool::new(false),
        left_index: AtomicU64::new(0),
        right_index: AtomicU64::new(0),
        me: me.clone(),
      }
    });
    subscriber.on_subscribe(Upstream::Plain(coordinator.clone()));

    let left = Arc::new(JoinHalf {
      parent: Arc::downgrade(&coordinator),
      wrap: JoinSignal::LeftValue as fn(L) -> JoinSignal<L, R>,
      slot: SubscriptionSlot::new(),
    });
    let right = Arc::new(JoinHalf {
      parent: Arc::downgrade(&coordinator),
      wrap: JoinSignal::RightValue as fn(R) -> JoinSignal<L, R>,
      slot: SubscriptionSlot::new(),
    });
    let _ = coordinator.left_half.set(left.clone());
    let _ = coordinator.right_half.set(right.clone());

    self.left.subscribe(left);
    self.right.subscribe(right);
  }
}

enum JoinSignal<L, R> {
  LeftValue(L),
  RightValue(R),
  LeftClose(u64),
  RightClose(u64),
}

struct JoinCoordinator<L, R, O> {
  actual: Arc<dyn Subscriber<O>>,
  queue: SegQueue<JoinSignal<L, R>>,
  left_end: WindowFn<L>,
  right_end: WindowFn<R>,
  selector: JoinSelector<L, R, O>,
  /// Live values by window index; touched only inside the drain.
  lefts: Mutex<BTreeMap<u64, L>>,
  rights: Mutex<BTreeMap<u64, R>>,
  /// Open window-end subscribers, keyed by (is_left, index).
  ends: Mutex<HashMap<(bool, u64), Arc<JoinEndSubscriber<L, R, O>>>>,
  left_half: OnceLock<Arc<JoinHalf<L, L, R, O>>>,
  right_half: OnceLock<Arc<JoinHalf<R, L, R, O>>>,
  wip: CachePadded<AtomicUsize>,
  requested: CachePadded<AtomicU64>,
  /// Primary inputs still running; completion needs this at zero and the
  /// signal queue empty.
  active: AtomicUsize,
  error: ErrorSlot,
  cancelled: AtomicBool,
  left_index: AtomicU64,
  right_index: AtomicU64,
  me: Weak<JoinCoordinator<L, R, O>>,
}

impl<L, R, O> JoinCoordinator<L, R, O>
where
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  fn clear_queue(&self) { while self.queue.pop().is_some() {} }

  fn cancel_all(&self) {
    if let Some(half) = self.left_half.get() {
      half.slot.cancel();
    }
    if let Some(half) = self.right_half.get() {
      half.slot.cancel();
    }
    for (_, end) in self.ends.lock().unwrap().drain() {
      end.slot.cancel();
    }
  }

  fn error_all(&self) {
    let Some(error) = self.error.take() else { return };
    self.lefts.lock().unwrap().clear();
    self.rights.lock().unwrap().clear();
    self.actual.on_error(error);
  }

  fn fail(&self, error: StreamError) {
    if !self.error.record(error.clone()) {
      on_error_dropped(error);
    }
    self.clear_queue();
    self.cancel_all();
    self.error_all();
  }

  fn half_error(&self, error: StreamError) {
    if self.error.record(error.clone()) {
      self.active.fetch_sub(1, Ordering::AcqRel);
      self.drain();
    } else {
      on_error_dropped(error);
    }
  }

  fn half_complete(&self) {
    self.active.fetch_sub(1, Ordering::AcqRel);
    self.drain();
  }

  fn window_error(&self, error: StreamError) {
    if self.error.record(error.clone()) {
      self.drain();
    } else {
      on_error_dropped(error);
    }
  }

  fn drain(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      return;
    }

    let mut missed = 1usize;
    loop {
      loop {
        if self.cancelled.load(Ordering::Acquire) {
          self.clear_queue();
          return;
        }
        if self.error.is_pending() {
          self.clear_queue();
          self.cancel_all();
          self.error_all();
          return;
        }

        let finished = self.active.load(Ordering::Acquire) == 0;
        let signal = self.queue.pop();
        if finished && signal.is_none() {
          self.lefts.lock().unwrap().clear();
          self.rights.lock().unwrap().clear();
          for (_, end) in self.ends.lock().unwrap().drain() {
            end.slot.cancel();
          }
          self.actual.on_complete();
          return;
        }
        let Some(signal) = signal else { break };

        let alive = match signal {
          JoinSignal::LeftValue(left) => self.handle_left(left),
          JoinSignal::RightValue(right) => self.handle_right(right),
          JoinSignal::LeftClose(index) => {
            self.lefts.lock().unwrap().remove(&index);
            self.ends.lock().unwrap().remove(&(true, index));
            true
          }
          JoinSignal::RightClose(index) => {
            self.rights.lock().unwrap().remove(&index);
            self.ends.lock().unwrap().remove(&(false, index));
            true
          }
        };
        if !alive {
          return;
        }
      }

      let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
      if prev == missed {
        break;
      }
      missed = prev - missed;
    }
  }

  /// Registers a left value, opens its window and pairs it with every live
  /// right. Returns `false` when the drain terminated.
  fn handle_left(&self, left: L) -> bool {
    let index = self.left_index.fetch_add(1, Ordering::Relaxed);
    let window = match catch_callback(|| (self.left_end)(&left)) {
      Err(e) => {
        self.fail(e);
        return false;
      }
      Ok(w) => w,
    };
    let end = Arc::new(JoinEndSubscriber {
      parent: self.me.clone(),
      is_left: true,
      index,
      slot: SubscriptionSlot::new(),
      closed: AtomicBool::new(false),
    });
    self.ends.lock().unwrap().insert((true, index), end.clone());
    window.subscribe(end);

    if self.error.is_pending() {
      self.clear_queue();
      self.cancel_all();
      self.error_all();
      return false;
    }

    let r = self.requested.load(Ordering::Acquire);
    let mut emitted = 0u64;
    let mut failure: Option<StreamError> = None;
    let mut exhausted = false;
    {
      let rights = self.rights.lock().unwrap();
      for right in rights.values() {
        match catch_callback(|| (self.selector)(&left, right)) {
          Err(e) => {
            failure = Some(e);
            break;
          }
          Ok(out) => {
            if emitted != r {
              self.actual.on_next(out);
              emitted += 1;
            } else {
              exhausted = true;
              break;
            }
          }
        }
      }
    }
    if let Some(e) = failure {
      self.fail(e);
      return false;
    }
    if exhausted {
      self.fail(StreamError::InsufficientDemand);
      return false;
    }
    if emitted != 0 {
      produced(&self.requested, emitted);
    }
    self.lefts.lock().unwrap().insert(index, left);
    true
  }

  fn handle_right(&self, right: R) -> bool {
    let index = self.right_index.fetch_add(1, Ordering::Relaxed);
    let window = match catch_callback(|| (self.right_end)(&right)) {
      Err(e) => {
        self.fail(e);
        return false;
      }
      Ok(w) => w,
    };
    let end = Arc::new(JoinEndSubscriber {
      parent: self.me.clone(),
      is_left: false,
      index,
      slot: SubscriptionSlot::new(),
      closed: AtomicBool::new(false),
    });
    self.ends.lock().unwrap().insert((false, index), end.clone());
    window.subscribe(end);

    if self.error.is_pending() {
      self.clear_queue();
      self.cancel_all();
      self.error_all();
      return false;
    }

    let r = self.requested.load(Ordering::Acquire);
    let mut emitted = 0u64;
    let mut failure: Option<StreamError> = None;
    let mut exhausted = false;
    {
      let lefts = self.lefts.lock().unwrap();
      for left in lefts.values() {
        match catch_callback(|| (self.selector)(left, &right)) {
          Err(e) => {
            failure = Some(e);
            break;
          }
          Ok(out) => {
            if emitted != r {
              self.actual.on_next(out);
              emitted += 1;
            } else {
              exhausted = true;
              break;
            }
          }
        }
      }
    }
    if let Some(e) = failure {
      self.fail(e);
      return false;
    }
    if exhausted {
      self.fail(StreamError::InsufficientDemand);
      return false;
    }
    if emitted != 0 {
      produced(&self.requested, emitted);
    }
    self.rights.lock().unwrap().insert(index, right);
    true
  }
}

impl<L, R, O> Subscription for JoinCoordinator<L, R, O>
where
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  fn request(&self, n: u64) {
    if demand::validate(n) {
      add_capped(&self.requested, n);
    }
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.cancel_all();
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      self.clear_queue();
    }
  }
}

/// One of the two primary inputs; values are forwarded to the coordinator's
/// signal queue unbounded, demand applies to the output only.
struct JoinHalf<V, L, R, O> {
  parent: Weak<JoinCoordinator<L, R, O>>,
  wrap: fn(V) -> JoinSignal<L, R>,
  slot: SubscriptionSlot<V>,
}

impl<V, L, R, O> Subscriber<V> for JoinHalf<V, L, R, O>
where
  V: Send + 'static,
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<V>) {
    if self.slot.set_once(upstream) {
      self.slot.request(UNBOUNDED);
    }
  }

  fn on_next(&self, value: V) {
    let Some(parent) = self.parent.upgrade() else {
      self.slot.cancel();
      return;
    };
    parent.queue.push((self.wrap)(value));
    parent.drain();
  }

  fn on_error(&self, error: StreamError) {
    let Some(parent) = self.parent.upgrade() else { return };
    parent.half_error(error);
  }

  fn on_complete(&self) {
    let Some(parent) = self.parent.upgrade() else { return };
    parent.half_complete();
  }
}

/// Watches one window publisher; its first emission or completion closes
/// the window it guards.
struct JoinEndSubscriber<L, R, O> {
  parent: Weak<JoinCoordinator<L, R, O>>,
  is_left: bool,
  index: u64,
  slot: SubscriptionSlot<()>,
  closed: AtomicBool,
}

impl<L, R, O> JoinEndSubscriber<L, R, O>
where
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.slot.cancel();
    let Some(parent) = self.parent.upgrade() else { return };
    parent.queue.push(if self.is_left {
      JoinSignal::LeftClose(self.index)
    } else {
      JoinSignal::RightClose(self.index)
    });
    parent.drain();
  }
}

impl<L, R, O> Subscriber<()> for JoinEndSubscriber<L, R, O>
where
  L: Send + 'static,
  R: Send + 'static,
  O: Send + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<()>) {
    if self.slot.set_once(upstream) {
      self.slot.request(UNBOUNDED);
    }
  }

  fn on_next(&self, _value: ()) { self.close(); }

  fn on_error(&self, error: StreamError) {
    if self.closed.swap(true, Ordering::AcqRel) {
      on_error_dropped(error);
      return;
    }
    let Some(parent) = self.parent.upgrade() else { return };
    parent.window_error(error);
  }

  fn on_complete(&self) { self.close(); }
}
