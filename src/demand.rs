//! Saturating demand arithmetic and the atomic bookkeeping helpers shared by
//! every operator: capped accumulation, production accounting and the
//! post-complete replay protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{on_error_dropped, StreamError};
use crate::subscriber::Subscriber;

/// The absorbing "no backpressure" demand.
pub const UNBOUNDED: u64 = u64::MAX;

/// Checks a `request` amount. A zero request is a protocol violation; it is
/// logged here and the caller decides whether its error path can surface it.
#[inline]
pub fn validate(n: u64) -> bool {
  if n == 0 {
    log::debug!("request amount must be positive");
    return false;
  }
  true
}

/// Adds two demand amounts, saturating at [`UNBOUNDED`].
#[inline]
pub fn add_cap(a: u64, b: u64) -> u64 { a.saturating_add(b) }

/// Subtracts produced items from outstanding demand, clamping at zero.
/// Over-production is a bookkeeping violation reported to the unsignalled
/// sink rather than a stream failure.
#[inline]
pub fn sub_cap(a: u64, b: u64) -> u64 {
  if b > a {
    on_error_dropped(StreamError::Overproduced);
    return 0;
  }
  a - b
}

/// Atomically accumulates demand into `cell`, saturating at [`UNBOUNDED`].
/// Returns the previous value.
pub fn add_capped(cell: &AtomicU64, n: u64) -> u64 {
  let mut current = cell.load(Ordering::Acquire);
  loop {
    if current == UNBOUNDED {
      return current;
    }
    let next = add_cap(current, n);
    match cell.compare_exchange_weak(
      current,
      next,
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      Ok(prev) => return prev,
      Err(observed) => current = observed,
    }
  }
}

/// Atomically accounts `n` produced items against `cell`, clamping at zero.
/// Returns the new outstanding demand. Unbounded demand is left untouched.
pub fn produced(cell: &AtomicU64, n: u64) -> u64 {
  let mut current = cell.load(Ordering::Acquire);
  loop {
    if current == UNBOUNDED {
      return current;
    }
    let next = sub_cap(current, n);
    match cell.compare_exchange_weak(
      current,
      next,
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      Ok(_) => return next,
      Err(observed) => current = observed,
    }
  }
}

// ---- post-complete replay -------------------------------------------------
//
// A masked demand counter for operators that buffer during the live phase
// and replay the buffer once upstream completes (take_last). Bit 63 flags
// completion; the low 63 bits carry demand, which therefore saturates at
// 2^63 - 1 inside this protocol.

pub(crate) const COMPLETED_MASK: u64 = 1 << 63;
const DEMAND_MASK: u64 = COMPLETED_MASK - 1;

#[inline]
fn add_cap_demand(a: u64, b: u64) -> u64 { a.saturating_add(b).min(DEMAND_MASK) }

/// Accounts a downstream request against the masked counter. Before
/// completion the request only accumulates; after completion the caller that
/// turns the demand from zero to non-zero drains the buffer.
pub(crate) fn post_complete_request<T>(
  requested: &AtomicU64,
  n: u64,
  actual: &Arc<dyn Subscriber<T>>,
  queue: &Mutex<VecDeque<T>>,
  cancelled: &AtomicBool,
) {
  let mut r = requested.load(Ordering::Acquire);
  loop {
    if r & COMPLETED_MASK != 0 {
      let u = add_cap_demand(r & DEMAND_MASK, n) | COMPLETED_MASK;
      match requested.compare_exchange_weak(
        r,
        u,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => {
          if r == COMPLETED_MASK {
            post_complete_drain(u, requested, actual, queue, cancelled);
          }
          return;
        }
        Err(observed) => r = observed,
      }
    } else {
      let u = add_cap_demand(r, n);
      match requested.compare_exchange_weak(
        r,
        u,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return,
        Err(observed) => r = observed,
      }
    }
  }
}

/// Flips the counter into its completed state; when demand was already
/// outstanding the caller drains the buffer immediately.
pub(crate) fn post_complete<T>(
  requested: &AtomicU64,
  actual: &Arc<dyn Subscriber<T>>,
  queue: &Mutex<VecDeque<T>>,
  cancelled: &AtomicBool,
) {
  let mut r = requested.load(Ordering::Acquire);
  loop {
    if r & COMPLETED_MASK != 0 {
      return;
    }
    match requested.compare_exchange_weak(
      r,
      r | COMPLETED_MASK,
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      Ok(_) => {
        if r != 0 {
          post_complete_drain(
            r | COMPLETED_MASK,
            requested,
            actual,
            queue,
            cancelled,
          );
        }
        return;
      }
      Err(observed) => r = observed,
    }
  }
}

fn post_complete_drain<T>(
  mut n: u64,
  requested: &AtomicU64,
  actual: &Arc<dyn Subscriber<T>>,
  queue: &Mutex<VecDeque<T>>,
  cancelled: &AtomicBool,
) {
  let mut e = COMPLETED_MASK;
  loop {
    while e != n {
      if cancelled.load(Ordering::Acquire) {
        return;
      }
      let next = queue.lock().unwrap().pop_front();
      match next {
        None => {
          actual.on_complete();
          return;
        }
        Some(v) => {
          actual.on_next(v);
          e += 1;
        }
      }
    }
    if cancelled.load(Ordering::Acquire) {
      return;
    }
    if queue.lock().unwrap().is_empty() {
      actual.on_complete();
      return;
    }
    n = requested.load(Ordering::Acquire);
    if n == e {
      n = requested.fetch_sub(e & DEMAND_MASK, Ordering::AcqRel)
        - (e & DEMAND_MASK);
      if n & DEMAND_MASK == 0 {
        return;
      }
      e = COMPLETED_MASK;
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn add_cap_saturates() {
    assert_eq!(add_cap(1, 2), 3);
    assert_eq!(add_cap(UNBOUNDED, 2), UNBOUNDED);
    assert_eq!(add_cap(UNBOUNDED - 1, 10), UNBOUNDED);
  }

  #[test]
  fn sub_cap_clamps_at_zero() {
    assert_eq!(sub_cap(5, 3), 2);
    assert_eq!(sub_cap(3, 5), 0);
    assert_eq!(sub_cap(UNBOUNDED, 1), UNBOUNDED - 1);
  }

  #[test]
  fn add_capped_accumulates_and_reports_previous() {
    let cell = AtomicU64::new(0);
    assert_eq!(add_capped(&cell, 5), 0);
    assert_eq!(add_capped(&cell, 7), 5);
    assert_eq!(cell.load(Ordering::Relaxed), 12);
    cell.store(UNBOUNDED, Ordering::Relaxed);
    assert_eq!(add_capped(&cell, 1), UNBOUNDED);
    assert_eq!(cell.load(Ordering::Relaxed), UNBOUNDED);
  }

  #[test]
  fn produced_leaves_unbounded_alone() {
    let cell = AtomicU64::new(10);
    assert_eq!(produced(&cell, 4), 6);
    cell.store(UNBOUNDED, Ordering::Relaxed);
    assert_eq!(produced(&cell, 4), UNBOUNDED);
  }

  #[test]
  fn zero_requests_are_invalid() {
    assert!(!validate(0));
    assert!(validate(1));
    assert!(validate(UNBOUNDED));
  }
}
