//! The consumer side of the signal contract.

use crate::error::StreamError;
use crate::subscription::Upstream;

/// A consumer of a demand-driven stream.
///
/// A well-behaved producer delivers exactly one `on_subscribe`, then zero or
/// more `on_next` calls, then at most one of `on_error` / `on_complete`.
/// Signals on one subscription are serialized; implementations never see two
/// of these methods run concurrently for the same subscription.
pub trait Subscriber<T>: Send + Sync {
  /// Delivers the upstream link. Demand must be signalled through it before
  /// any item flows.
  fn on_subscribe(&self, upstream: Upstream<T>);

  fn on_next(&self, value: T);

  fn on_error(&self, error: StreamError);

  fn on_complete(&self);

  /// Signals that an upstream operating in async fusion mode has made an
  /// item available through `poll`. Only consumers that negotiated async
  /// fusion ever receive this; the default ignores it.
  fn on_poll_ready(&self) {}
}

/// A subscriber that can tell immediately whether it consumed a value,
/// letting the producer skip per-item demand accounting for dropped values.
pub trait ConditionalSubscriber<T>: Subscriber<T> {
  /// Tries to consume `value`; returns `false` when the value was dropped
  /// and another may be delivered immediately without a new request.
  fn try_on_next(&self, value: T) -> bool;
}
