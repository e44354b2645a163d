//! A set-once subscription arbiter that buffers demand issued before the
//! upstream subscription arrives.

use std::sync::{Arc, Mutex};

use crate::demand::{self, add_cap};
use crate::error::{on_error_dropped, StreamError};
use crate::subscription::Subscription;

enum State {
  /// No subscription yet; demand accumulates here.
  Waiting { pending: u64 },
  Active(Arc<dyn Subscription>),
  Cancelled,
}

/// Arbitrates requests and cancellation for a subscription that is set at
/// most once, possibly after downstream has already issued requests.
///
/// All demand buffered while waiting is replayed exactly once when the
/// subscription arrives; at most one non-cancelled subscription is ever
/// active.
pub struct DeferredSubscription {
  state: Mutex<State>,
}

impl Default for DeferredSubscription {
  fn default() -> Self { Self::new() }
}

impl DeferredSubscription {
  pub fn new() -> Self {
    DeferredSubscription { state: Mutex::new(State::Waiting { pending: 0 }) }
  }

  /// Starts with demand already outstanding.
  pub fn with_initial_request(n: u64) -> Self {
    DeferredSubscription { state: Mutex::new(State::Waiting { pending: n }) }
  }

  /// Installs the upstream subscription. Returns `false` when the slot was
  /// cancelled or already taken; the incoming subscription is cancelled in
  /// both cases.
  pub fn set(&self, subscription: Arc<dyn Subscription>) -> bool {
    let replay = {
      let mut state = self.state.lock().unwrap();
      match &*state {
        State::Waiting { pending } => {
          let pending = *pending;
          *state = State::Active(subscription.clone());
          pending
        }
        State::Active(_) => {
          drop(state);
          subscription.cancel();
          on_error_dropped(StreamError::DuplicateSubscription);
          return false;
        }
        State::Cancelled => {
          drop(state);
          subscription.cancel();
          return false;
        }
      }
    };
    if replay != 0 {
      subscription.request(replay);
    }
    true
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(&*self.state.lock().unwrap(), State::Cancelled)
  }
}

impl Subscription for DeferredSubscription {
  fn request(&self, n: u64) {
    if !demand::validate(n) {
      return;
    }
    let target = {
      let mut state = self.state.lock().unwrap();
      match &mut *state {
        State::Waiting { pending } => {
          *pending = add_cap(*pending, n);
          None
        }
        State::Active(s) => Some(s.clone()),
        State::Cancelled => None,
      }
    };
    if let Some(s) = target {
      s.request(n);
    }
  }

  fn cancel(&self) {
    let previous = {
      let mut state = self.state.lock().unwrap();
      std::mem::replace(&mut *state, State::Cancelled)
    };
    if let State::Active(s) = previous {
      s.cancel();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::testkit::ProbeSubscription;

  #[test]
  fn buffered_demand_is_replayed_once() {
    let arbiter = DeferredSubscription::new();
    arbiter.request(3);
    arbiter.request(4);
    let probe = ProbeSubscription::new();
    assert!(arbiter.set(probe.clone()));
    assert_eq!(probe.requested(), 7);

    arbiter.request(2);
    assert_eq!(probe.requested(), 9);
  }

  #[test]
  fn initial_request_counts_as_buffered_demand() {
    let arbiter = DeferredSubscription::with_initial_request(5);
    let probe = ProbeSubscription::new();
    assert!(arbiter.set(probe.clone()));
    assert_eq!(probe.requested(), 5);
  }

  #[test]
  fn second_subscription_is_cancelled() {
    let arbiter = DeferredSubscription::new();
    let first = ProbeSubscription::new();
    let second = ProbeSubscription::new();
    assert!(arbiter.set(first.clone()));
    assert!(!arbiter.set(second.clone()));
    assert!(second.is_cancelled());
    assert!(!first.is_cancelled());
  }

  #[test]
  fn set_after_cancel_cancels_the_incoming_subscription() {
    let arbiter = DeferredSubscription::new();
    arbiter.cancel();
    let late = ProbeSubscription::new();
    assert!(!arbiter.set(late.clone()));
    assert!(late.is_cancelled());
    assert!(arbiter.is_cancelled());
  }

  #[test]
  fn cancel_reaches_the_active_subscription() {
    let arbiter = DeferredSubscription::new();
    let probe = ProbeSubscription::new();
    assert!(arbiter.set(probe.clone()));
    arbiter.cancel();
    arbiter.cancel();
    assert!(probe.is_cancelled());
  }
}
