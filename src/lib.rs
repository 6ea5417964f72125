//! streamalloc - stream-ordered asynchronous allocation cache
//!
//! A multi-backend memory allocation cache for JIT compilers that
//! evaluate computation kernels on GPUs and on a CPU worker pool. Kernel
//! runs need many transient buffers whose sizes are only known just in
//! time; hitting the OS or GPU allocator for each one is prohibitively
//! expensive, and freeing a device buffer while an asynchronous kernel
//! still reads it is a use-after-free. The cache solves both problems:
//! allocations are bucketed by size and recycled from free lists, and
//! frees of stream-ordered memory are deferred until the owning stream
//! has provably executed past the last use.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use streamalloc::backend::SimDriver;
//! use streamalloc::{set_active_stream, AllocCache, AllocKind};
//!
//! # fn main() -> streamalloc::AllocResult<()> {
//! let cache = AllocCache::new(Arc::new(SimDriver::new(1)));
//! let stream = cache.create_gpu_stream(0)?;
//! set_active_stream(Some(Arc::clone(&stream)));
//!
//! let buf = cache.alloc(AllocKind::Device, 1000)?;
//! cache.free(buf)?;
//!
//! // The freed pointer comes straight back on the same stream.
//! let again = cache.alloc(AllocKind::Device, 1000)?;
//! assert_eq!(buf, again);
//! cache.free(again)?;
//!
//! // Hand pending frees to the global cache once the stream drains.
//! cache.flush()?;
//! stream.sync()?;
//!
//! set_active_stream(None);
//! cache.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod stream;
#[cfg(feature = "host-async")]
pub mod worker;

pub use backend::{Driver, DriverError, StreamHandle};
pub use cache::{AllocCache, AllocInfo, AllocKind};
pub use error::{AllocError, AllocResult, ErrorCategory};
pub use metrics::{mem_string, MemoryMetrics};
pub use stream::{active_stream, set_active_stream, Device, Stream};
