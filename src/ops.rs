//! The multi-source coordinators and boundary operators.

pub mod join;
pub mod observe_on;
pub mod reduce_full;
pub mod take_last;
pub mod zip;

pub use join::Join;
pub use observe_on::ObserveOn;
pub use reduce_full::ReduceFull;
pub use take_last::TakeLast;
pub use zip::Zip;
