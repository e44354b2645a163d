//! rivulet — a demand-driven reactive-streams core.
//!
//! The crate implements the four-signal contract (`on_subscribe`,
//! `on_next`, `on_error`, `on_complete`) gated by cooperative
//! backpressure, the lock-free arbiters that make it safe under
//! concurrency, an opt-in queue-fusion fast path, and a set of
//! multi-source coordinators built on top: [`ops::Zip`], [`ops::Join`],
//! [`ops::ReduceFull`], [`ops::ObserveOn`] and [`ops::TakeLast`].
//!
//! Every coordinator serializes its work through a `wip` ticket: the
//! caller that raises the counter from zero owns the drain loop, everyone
//! else has merely woken it. No drain ever blocks; suspension is just an
//! exited drain waiting for the next inbound signal.

#[macro_use]
extern crate lazy_static;

pub mod arbiter;
pub mod demand;
pub mod error;
pub mod fusion;
pub mod ops;
pub mod publisher;
pub(crate) mod queue;
pub mod scheduler;
pub mod source;
pub mod subscriber;
pub mod subscription;
pub mod testkit;

pub mod prelude {
  pub use crate::arbiter::{DeferredScalar, DeferredSubscription,
                           MultiSubscription};
  pub use crate::demand::{add_cap, sub_cap, UNBOUNDED};
  pub use crate::error::{ErrorSlot, StreamError};
  pub use crate::fusion::{FusionMode, QueueSubscription};
  pub use crate::ops::{Join, ObserveOn, ReduceFull, TakeLast, Zip};
  pub use crate::publisher::{Publisher, Source};
  pub use crate::scheduler::{CachedThreadScheduler, Disposable, Rejected,
                             Scheduler, Worker};
  pub use crate::source::{empty, fail, from_iter, just};
  pub use crate::subscriber::{ConditionalSubscriber, Subscriber};
  pub use crate::subscription::{EmptySubscription, Subscription,
                                SubscriptionSlot, Upstream};
}
