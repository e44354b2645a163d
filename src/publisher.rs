//! Producers: the `Publisher` trait and the assembly-time source
//! description used by operators with scalar fast paths.

use std::sync::Arc;

use crate::subscriber::{ConditionalSubscriber, Subscriber};
use crate::subscription::Upstream;

/// A demand-driven producer of `T` values.
pub trait Publisher<T: Send + 'static>: Send + Sync {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);

  /// Subscribes a consumer that supports `try_on_next`. Producers that have
  /// a dedicated conditional path override this; the default adapts the
  /// consumer to the plain path.
  fn subscribe_conditional(
    &self,
    subscriber: Arc<dyn ConditionalSubscriber<T>>,
  ) {
    self.subscribe(Arc::new(StrictAdapter { inner: subscriber }));
  }
}

struct StrictAdapter<T> {
  inner: Arc<dyn ConditionalSubscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for StrictAdapter<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    self.inner.on_subscribe(upstream);
  }

  fn on_next(&self, value: T) { self.inner.on_next(value); }

  fn on_error(&self, error: crate::error::StreamError) {
    self.inner.on_error(error);
  }

  fn on_complete(&self) { self.inner.on_complete(); }

  fn on_poll_ready(&self) { self.inner.on_poll_ready(); }
}

/// A supplier evaluated once at subscribe time. `None` stands for an empty
/// scalar source.
pub type ScalarSupplier<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// What an operator knows about an input at assembly time: either a scalar
/// value available synchronously, or a full stream.
pub enum Source<T> {
  Scalar(ScalarSupplier<T>),
  Stream(Arc<dyn Publisher<T>>),
}

impl<T> Clone for Source<T> {
  fn clone(&self) -> Self {
    match self {
      Source::Scalar(f) => Source::Scalar(f.clone()),
      Source::Stream(p) => Source::Stream(p.clone()),
    }
  }
}

impl<T: Send + 'static> Source<T> {
  pub fn scalar(
    supplier: impl Fn() -> Option<T> + Send + Sync + 'static,
  ) -> Self {
    Source::Scalar(Arc::new(supplier))
  }

  pub fn stream(publisher: Arc<dyn Publisher<T>>) -> Self {
    Source::Stream(publisher)
  }
}

impl<T: Clone + Send + Sync + 'static> Source<T> {
  /// A scalar source holding a known value.
  pub fn value(value: T) -> Self {
    Source::Scalar(Arc::new(move || Some(value.clone())))
  }
}
