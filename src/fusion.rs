//! Queue-fusion: the opt-in fast path that lets an operator expose itself as
//! both a subscription and a pull-queue, eliding per-item request/next
//! round-trips.

use crate::subscription::Subscription;

/// Fusion negotiation vocabulary. `Sync`, `Async` and `Any` are valid
/// requests; `None`, `Sync` and `Async` are valid replies. The negotiated
/// mode is fixed for the lifetime of the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
  /// Fusion declined; the regular request/next protocol applies.
  None,
  /// The producer is finite and synchronous. The consumer drives entirely
  /// by `poll`; `poll() == None` means the sequence is complete and no
  /// signal is delivered through the subscriber any more.
  Sync,
  /// The producer stays push-driven but delivers through `poll`: it signals
  /// availability with `on_poll_ready` and flags completion through its
  /// terminal signal, which the consumer observes before treating an empty
  /// poll as the end.
  Async,
  /// Request-only wildcard: the producer picks `Sync` or `Async`.
  Any,
}

/// A subscription that doubles as a pull-queue once fusion is negotiated.
pub trait QueueSubscription<T>: Subscription {
  /// Negotiates a fusion mode. Must be called from within `on_subscribe`,
  /// before any other interaction with the subscription.
  fn request_fusion(&self, mode: FusionMode) -> FusionMode;

  /// Pulls the next available item. Its meaning depends on the negotiated
  /// mode; see [`FusionMode`].
  fn poll(&self) -> Option<T>;

  fn is_empty(&self) -> bool;

  /// Discards all queued items.
  fn clear(&self);
}
