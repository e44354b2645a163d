//! A switching subscription arbiter: accepts repeated subscription swaps
//! while keeping the outstanding demand exact across switches.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

use crate::demand::{self, add_cap, add_capped, sub_cap, UNBOUNDED};
use crate::subscription::Subscription;

struct Confined {
  actual: Option<Arc<dyn Subscription>>,
  requested: u64,
  unbounded: bool,
}

/// Arbitrates demand across a sequence of upstream subscriptions.
///
/// Switching should only happen once the source behind the current
/// subscription has stopped emitting, otherwise two sources may share one
/// request window. Call [`produced`](MultiSubscription::produced) (or
/// [`produced_one`](MultiSubscription::produced_one)) after each delivered
/// element so a replacement subscription is only asked for the remainder.
///
/// Uncontended calls mutate the state directly under a `wip` ticket; the
/// contended path deposits into missed slots that the drain reconciles.
pub struct MultiSubscription {
  inner: Mutex<Confined>,
  missed_subscription: Mutex<Option<Arc<dyn Subscription>>>,
  missed_requested: AtomicU64,
  missed_produced: AtomicU64,
  wip: CachePadded<AtomicUsize>,
  cancelled: AtomicBool,
  cancel_on_switch: bool,
}

impl MultiSubscription {
  /// `cancel_on_switch` controls whether installing a new subscription
  /// cancels the previous one.
  pub fn new(cancel_on_switch: bool) -> Self {
    MultiSubscription {
      inner: Mutex::new(Confined {
        actual: None,
        requested: 0,
        unbounded: false,
      }),
      missed_subscription: Mutex::new(None),
      missed_requested: AtomicU64::new(0),
      missed_produced: AtomicU64::new(0),
      wip: CachePadded::new(AtomicUsize::new(0)),
      cancelled: AtomicBool::new(false),
      cancel_on_switch,
    }
  }

  #[inline]
  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }

  #[inline]
  pub fn is_unbounded(&self) -> bool {
    self.inner.lock().unwrap().unbounded
  }

  fn try_enter(&self) -> bool {
    self.wip.load(Ordering::Acquire) == 0
      && self
        .wip
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
  }

  /// Leaves the fast path; runs the drain when signals arrived meanwhile.
  fn leave(&self) {
    if self.wip.fetch_sub(1, Ordering::AcqRel) != 1 {
      self.drain_loop();
    }
  }

  /// Installs `subscription` as the current upstream, replaying the
  /// outstanding demand to it.
  pub fn set(&self, subscription: Arc<dyn Subscription>) {
    if self.cancelled.load(Ordering::Acquire) {
      subscription.cancel();
      return;
    }

    if self.try_enter() {
      let (to_cancel, replay) = {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.actual.replace(subscription.clone());
        let to_cancel = if self.cancel_on_switch { old } else { None };
        (to_cancel, inner.requested)
      };
      if let Some(old) = to_cancel {
        old.cancel();
      }
      if replay != 0 {
        subscription.request(replay);
      }
      self.leave();
      return;
    }

    let displaced =
      self.missed_subscription.lock().unwrap().replace(subscription);
    if let Some(displaced) = displaced {
      if self.cancel_on_switch {
        displaced.cancel();
      }
    }
    self.drain();
  }

  /// Accounts `n` delivered elements against the outstanding demand.
  pub fn produced(&self, n: u64) {
    if self.try_enter() {
      {
        let mut inner = self.inner.lock().unwrap();
        if inner.requested != UNBOUNDED {
          inner.requested = sub_cap(inner.requested, n);
        } else {
          inner.unbounded = true;
        }
      }
      self.leave();
      return;
    }
    add_capped(&self.missed_produced, n);
    self.drain();
  }

  #[inline]
  pub fn produced_one(&self) { self.produced(1) }

  fn drain(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      return;
    }
    self.drain_loop();
  }

  fn drain_loop(&self) {
    let mut missed = 1usize;
    loop {
      let incoming = self.missed_subscription.lock().unwrap().take();
      let mr = match self.missed_requested.load(Ordering::Acquire) {
        0 => 0,
        _ => self.missed_requested.swap(0, Ordering::AcqRel),
      };
      let mp = match self.missed_produced.load(Ordering::Acquire) {
        0 => 0,
        _ => self.missed_produced.swap(0, Ordering::AcqRel),
      };

      let mut cancel_current: Option<Arc<dyn Subscription>> = None;
      let mut cancel_incoming: Option<Arc<dyn Subscription>> = None;
      let mut forward: Option<(Arc<dyn Subscription>, u64)> = None;
      {
        let mut inner = self.inner.lock().unwrap();
        if self.cancelled.load(Ordering::Acquire) {
          cancel_current = inner.actual.take();
          cancel_incoming = incoming;
        } else {
          let mut r = inner.requested;
          if r != UNBOUNDED {
            let grown = add_cap(r, mr);
            r = if grown != UNBOUNDED { sub_cap(grown, mp) } else { grown };
            inner.requested = r;
          }
          if let Some(next) = incoming {
            let old = inner.actual.replace(next.clone());
            if self.cancel_on_switch {
              cancel_current = old;
            }
            if r != 0 {
              forward = Some((next, r));
            }
          } else if mr != 0 {
            if let Some(current) = &inner.actual {
              forward = Some((current.clone(), mr));
            }
          }
        }
      }
      if let Some(s) = cancel_current {
        s.cancel();
      }
      if let Some(s) = cancel_incoming {
        s.cancel();
      }
      if let Some((s, amount)) = forward {
        s.request(amount);
      }

      let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
      if prev == missed {
        return;
      }
      missed = prev - missed;
    }
  }
}

impl Subscription for MultiSubscription {
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      return;
    }
    if self.try_enter() {
      let forward = {
        let mut inner = self.inner.lock().unwrap();
        if !inner.unbounded {
          if inner.requested != UNBOUNDED {
            inner.requested = add_cap(inner.requested, n);
            if inner.requested == UNBOUNDED {
              inner.unbounded = true;
            }
          }
          inner.actual.clone()
        } else {
          None
        }
      };
      if let Some(current) = forward {
        current.request(n);
      }
      self.leave();
      return;
    }
    add_capped(&self.missed_requested, n);
    self.drain();
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.drain();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::testkit::ProbeSubscription;

  #[test]
  fn demand_buffered_before_the_first_subscription_is_replayed() {
    let arbiter = MultiSubscription::new(false);
    arbiter.request(5);
    let first = ProbeSubscription::new();
    arbiter.set(first.clone());
    assert_eq!(first.requested(), 5);
  }

  #[test]
  fn a_switch_re_requests_only_the_remainder() {
    let arbiter = MultiSubscription::new(false);
    arbiter.request(5);
    let first = ProbeSubscription::new();
    arbiter.set(first.clone());
    arbiter.produced(2);

    let second = ProbeSubscription::new();
    arbiter.set(second.clone());
    assert_eq!(second.requested(), 3);
    assert!(!first.is_cancelled());
  }

  #[test]
  fn switch_policy_cancels_the_previous_subscription() {
    let arbiter = MultiSubscription::new(true);
    let first = ProbeSubscription::new();
    arbiter.set(first.clone());
    let second = ProbeSubscription::new();
    arbiter.set(second.clone());
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
  }

  #[test]
  fn unbounded_demand_is_absorbing() {
    let arbiter = MultiSubscription::new(false);
    let first = ProbeSubscription::new();
    arbiter.set(first.clone());
    arbiter.request(UNBOUNDED);
    assert!(arbiter.is_unbounded());
    arbiter.produced(10);

    let second = ProbeSubscription::new();
    arbiter.set(second.clone());
    assert_eq!(second.requested(), UNBOUNDED);
  }

  #[test]
  fn cancel_reaches_current_and_incoming_subscriptions() {
    let arbiter = MultiSubscription::new(false);
    let first = ProbeSubscription::new();
    arbiter.set(first.clone());
    arbiter.cancel();
    assert!(first.is_cancelled());
    assert!(arbiter.is_cancelled());

    let late = ProbeSubscription::new();
    arbiter.set(late.clone());
    assert!(late.is_cancelled());
  }

  #[test]
  fn over_production_clamps_at_zero() {
    let arbiter = MultiSubscription::new(false);
    arbiter.request(2);
    let first = ProbeSubscription::new();
    arbiter.set(first.clone());
    arbiter.produced(5);

    let second = ProbeSubscription::new();
    arbiter.set(second.clone());
    assert_eq!(second.requested(), 0);
  }
}
