//! Well-behaved producers used to feed operator chains: a synchronous
//! fuseable iterator source and scalar/trivial conveniences.

use std::sync::Arc;

use crate::arbiter::DeferredScalar;
use crate::error::StreamError;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;
use crate::subscription::{EmptySubscription, Upstream};

pub mod from_iter;

pub use from_iter::{from_iter, FromIter};

/// A publisher of exactly one value.
pub struct Just<T> {
  value: T,
}

/// Emits `value` once demand arrives, then completes.
pub fn just<T: Clone + Send + 'static>(value: T) -> Arc<Just<T>> {
  Arc::new(Just { value })
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for Just<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let scalar = Arc::new(DeferredScalar::new(subscriber.clone()));
    subscriber.on_subscribe(Upstream::Fused(scalar.clone()));
    scalar.complete(self.value.clone());
  }
}

/// A publisher that completes without emitting.
pub struct Empty;

pub fn empty() -> Arc<Empty> { Arc::new(Empty) }

impl<T: Send + 'static> Publisher<T> for Empty {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    EmptySubscription::complete_to(&subscriber);
  }
}

/// A publisher that fails immediately.
pub struct Fail {
  error: StreamError,
}

pub fn fail(error: StreamError) -> Arc<Fail> { Arc::new(Fail { error }) }

impl<T: Send + 'static> Publisher<T> for Fail {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    EmptySubscription::error_to(&subscriber, self.error.clone());
  }
}
