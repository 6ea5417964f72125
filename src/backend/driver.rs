//! Raw driver abstraction consumed by the allocation cache.
//!
//! The cache never talks to an allocator or a GPU runtime directly; it
//! goes through [`Driver`]. One implementation binds the HIP runtime
//! (`rocm` feature), another simulates streams in-process for tests and
//! GPU-less development. The cache's locking discipline depends on one
//! property of every implementation: driver calls may block or take
//! driver-internal locks, so the cache never holds its own lock across
//! them.

use std::ffi::c_void;

use thiserror::Error;

/// Driver-level failures.
///
/// `OutOfMemory` is special-cased by the cache (it triggers the single
/// trim-and-retry); everything else propagates to the caller untouched.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("allocation of {size} bytes refused")]
    OutOfMemory { size: usize },
    #[error("no device with index {0}")]
    InvalidDevice(i32),
    #[error("driver API failure: {0}")]
    Api(String),
}

/// Driver result type.
pub type DriverResult<T> = Result<T, DriverError>;

/// Opaque per-driver stream token.
///
/// For the HIP driver this is the `hipStream_t` pointer; the simulated
/// driver uses an index into its stream table. The cache only moves the
/// token around, it never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub usize);

/// Host-function continuation submitted behind a stream's prior work.
pub type HostFn = Box<dyn FnOnce() + Send + 'static>;

/// Raw allocation, copy and synchronization primitives.
///
/// Contracts the cache relies on:
///
/// - Allocation methods return `DriverError::OutOfMemory` when the
///   request is refused for lack of memory, and never return null on
///   success.
/// - `launch_host_func(stream, f)` runs `f` exactly once, after every
///   submission made to `stream` before the call has completed. `f` must
///   not call back into the driver; implementations may run it on an
///   internal thread with driver locks held.
/// - `memcpy_async` orders the copy behind prior work on `stream`; the
///   bytes are observable after `sync_stream`.
pub trait Driver: Send + Sync + std::fmt::Debug + 'static {
    /// Number of usable devices. May be zero; host-only allocation still
    /// works in that case.
    fn device_count(&self) -> usize;

    /// 64-byte-aligned host memory.
    fn host_alloc(&self, size: usize) -> DriverResult<*mut c_void>;

    /// Release memory from `host_alloc`. `size` is the bucket size the
    /// pointer was allocated with.
    fn host_free(&self, ptr: *mut c_void, size: usize);

    /// Page-locked host memory, DMA-reachable from every device.
    fn pinned_alloc(&self, size: usize) -> DriverResult<*mut c_void>;

    fn pinned_free(&self, ptr: *mut c_void);

    /// Memory local to `device`.
    fn device_alloc(&self, device: i32, size: usize) -> DriverResult<*mut c_void>;

    fn device_free(&self, ptr: *mut c_void);

    /// Unified memory; `read_mostly` applies the duplication-friendly
    /// access advice at allocation time.
    fn managed_alloc(&self, size: usize, read_mostly: bool) -> DriverResult<*mut c_void>;

    /// Register existing host memory for DMA access.
    fn host_register(&self, ptr: *mut c_void, size: usize) -> DriverResult<()>;

    /// Undo `host_register`. Must not be called from a host function.
    fn host_unregister(&self, ptr: *mut c_void);

    fn create_stream(&self, device: i32) -> DriverResult<StreamHandle>;

    fn destroy_stream(&self, stream: StreamHandle);

    fn memcpy_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        stream: StreamHandle,
    ) -> DriverResult<()>;

    fn launch_host_func(&self, stream: StreamHandle, f: HostFn) -> DriverResult<()>;

    /// Migrate a managed range towards `device`; `device == -1` targets
    /// host memory.
    fn prefetch_async(
        &self,
        ptr: *mut c_void,
        size: usize,
        device: i32,
        stream: StreamHandle,
    ) -> DriverResult<()>;

    /// Block until `stream` has drained.
    fn sync_stream(&self, stream: StreamHandle) -> DriverResult<()>;

    /// Block until every stream on `device` has drained.
    fn sync_device(&self, device: i32) -> DriverResult<()>;

    /// Block until every device has drained.
    fn sync_all(&self) -> DriverResult<()>;
}
