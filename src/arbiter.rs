//! Subscription arbiters: the building blocks that gate races between
//! requests, emissions, cancellation and subscription swaps.

pub mod deferred;
pub mod deferred_scalar;
pub mod multi;

pub use deferred::DeferredSubscription;
pub use deferred_scalar::DeferredScalar;
pub use multi::MultiSubscription;
