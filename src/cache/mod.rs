//! Size-bucketed, stream-ordered allocation cache.
//!
//! The modules here implement the cache proper: allocation descriptors
//! and size classification ([`info`]), per-stream deferred-free chains
//! ([`chain`]), and the public allocator surface ([`allocator`]).

pub mod allocator;
pub(crate) mod chain;
pub mod info;

pub use allocator::AllocCache;
pub use info::{bucket_size, round_pow2, AllocInfo, AllocKind, BASE_ALIGN};
