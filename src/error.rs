//! Unified error handling for streamalloc.
//!
//! A single [`AllocError`] covers the public surface. Errors are
//! categorized for handling decisions: usage errors surface to the caller
//! and are never retried, out-of-memory drives the single trim-and-retry
//! inside the cache, driver errors propagate untouched, and internal
//! errors indicate bugs.

use crate::backend::DriverError;
use crate::cache::AllocKind;

/// Unified error type for the allocation cache.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The raw allocator refused twice (once before and once after a
    /// cache trim).
    #[error("out of memory: could not allocate {size} bytes of {kind} memory")]
    OutOfMemory { kind: AllocKind, size: usize },

    /// An operation that needs a stream was called with none active.
    #[error("no active stream: {op} requires one")]
    NoActiveStream { op: &'static str },

    /// The active stream's backend does not match the operation.
    #[error("wrong backend: {op} requires a {expected} stream")]
    WrongBackend {
        op: &'static str,
        expected: &'static str,
    },

    /// The pointer is not registered in the live table.
    #[error("unknown address {addr:#x}")]
    UnknownPointer { addr: usize },

    /// Prefetch is only defined for managed memory.
    #[error("prefetch expects managed or managed-read-mostly memory, got {0}")]
    InvalidKindForPrefetch(AllocKind),

    /// The requested migration pair is not supported.
    #[error("unsupported migration: {from} -> {to}")]
    UnsupportedMigration { from: AllocKind, to: AllocKind },

    /// Device index outside the registry.
    #[error("invalid device ID: {0}")]
    InvalidDevice(i32),

    /// Failure reported by the underlying driver.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Lock poisoned (indicates a bug)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for AllocError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AllocError::LockPoisoned(err.to_string())
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller misuse - fix the call site, never retried
    Usage,
    /// Memory pressure - the cache already spent its one trim-retry
    OutOfMemory,
    /// Driver failure - may indicate GPU or runtime issues
    Backend,
    /// Internal error - indicates a bug
    Internal,
}

impl AllocError {
    /// Categorize the error for handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AllocError::NoActiveStream { .. }
            | AllocError::WrongBackend { .. }
            | AllocError::UnknownPointer { .. }
            | AllocError::InvalidKindForPrefetch(_)
            | AllocError::UnsupportedMigration { .. }
            | AllocError::InvalidDevice(_) => ErrorCategory::Usage,

            AllocError::OutOfMemory { .. } => ErrorCategory::OutOfMemory,

            AllocError::Driver(_) => ErrorCategory::Backend,

            AllocError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is caller misuse (actionable at the call site).
    pub fn is_usage_error(&self) -> bool {
        self.category() == ErrorCategory::Usage
    }

    /// Check if this is a memory-pressure error. The cache has already
    /// trimmed and retried once; the caller may free memory and retry.
    pub fn is_out_of_memory(&self) -> bool {
        self.category() == ErrorCategory::OutOfMemory
    }

    /// Check if this is an internal error (indicates a bug).
    pub fn is_internal_error(&self) -> bool {
        self.category() == ErrorCategory::Internal
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Usage => write!(f, "Usage"),
            ErrorCategory::OutOfMemory => write!(f, "OutOfMemory"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Result alias used throughout the crate.
pub type AllocResult<T> = std::result::Result<T, AllocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            AllocError::NoActiveStream {
                op: "device memory allocation"
            }
            .category(),
            ErrorCategory::Usage
        );
        assert_eq!(
            AllocError::UnknownPointer { addr: 0xdead }.category(),
            ErrorCategory::Usage
        );
        assert_eq!(
            AllocError::OutOfMemory {
                kind: AllocKind::Host,
                size: 4096
            }
            .category(),
            ErrorCategory::OutOfMemory
        );
        assert_eq!(
            AllocError::Driver(DriverError::Api("boom".to_string())).category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            AllocError::LockPoisoned("test".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_category_helpers() {
        assert!(AllocError::InvalidDevice(7).is_usage_error());
        assert!(AllocError::OutOfMemory {
            kind: AllocKind::Device,
            size: 1 << 30
        }
        .is_out_of_memory());
        assert!(AllocError::LockPoisoned("test".to_string()).is_internal_error());
        assert!(!AllocError::InvalidDevice(7).is_internal_error());
    }

    #[test]
    fn test_error_display() {
        let err = AllocError::OutOfMemory {
            kind: AllocKind::Device,
            size: 1024,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: could not allocate 1024 bytes of device memory"
        );

        let err = AllocError::UnsupportedMigration {
            from: AllocKind::HostAsync,
            to: AllocKind::Device,
        };
        assert_eq!(
            err.to_string(),
            "unsupported migration: host-async -> device"
        );

        let err = AllocError::UnknownPointer { addr: 0x1000 };
        assert_eq!(err.to_string(), "unknown address 0x1000");
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::PoisonError;

        fn convert<T>(err: PoisonError<T>) -> AllocError {
            AllocError::from(err)
        }
        let _ = convert::<i32> as fn(PoisonError<i32>) -> AllocError;
    }
}
