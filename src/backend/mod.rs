//! Driver backends consumed by the allocation cache.
//!
//! [`driver::Driver`] is the raw-primitive abstraction; [`sim::SimDriver`]
//! is the deterministic in-process implementation used by the test suite
//! and by GPU-less development, and [`hip::HipDriver`] (behind the `rocm`
//! feature) binds the real HIP runtime.

pub mod driver;
#[cfg(feature = "rocm")]
pub mod hip;
pub mod sim;

pub use driver::{Driver, DriverError, DriverResult, HostFn, StreamHandle};
#[cfg(feature = "rocm")]
pub use hip::HipDriver;
pub use sim::SimDriver;
