//! Allocation descriptors and size classification.
//!
//! Every allocation the cache manages is classified by an [`AllocInfo`]
//! triple `(kind, device, size)`. The triple is the identity of a cache
//! bucket: two pointers with equal `AllocInfo` are interchangeable, which
//! is what makes recycling safe. Sizes are bucketed to powers of two so
//! the number of distinct buckets stays small and hit rates stay high.

use std::fmt;

/// Memory flavors understood by the cache.
///
/// The kind decides who may touch the memory (CPU, one GPU, or both),
/// which raw allocator backs it, and whether freed pointers may be
/// recycled per-stream or only through the global cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum AllocKind {
    /// Ordinary aligned host memory, CPU access only.
    Host,
    /// Host memory tied to a CPU worker-pool stream.
    HostAsync,
    /// Page-locked host memory registered with the driver for DMA.
    HostPinned,
    /// Memory local to a single GPU.
    Device,
    /// Unified memory visible to the CPU and every GPU.
    Managed,
    /// Unified memory with a read-mostly usage hint.
    ManagedReadMostly,
}

impl AllocKind {
    /// Number of kinds; sizes the per-kind counter arrays.
    pub const COUNT: usize = 6;

    /// All kinds, in counter-array order.
    pub const ALL: [AllocKind; Self::COUNT] = [
        AllocKind::Host,
        AllocKind::HostAsync,
        AllocKind::HostPinned,
        AllocKind::Device,
        AllocKind::Managed,
        AllocKind::ManagedReadMostly,
    ];

    /// Index into per-kind counter arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            AllocKind::Host => "host",
            AllocKind::HostAsync => "host-async",
            AllocKind::HostPinned => "host-pinned",
            AllocKind::Device => "device",
            AllocKind::Managed => "managed",
            AllocKind::ManagedReadMostly => "managed-read-mostly",
        }
    }

    /// Fixed-width name for columnar trim/leak reports.
    pub fn short_name(self) -> &'static str {
        match self {
            AllocKind::Host => "host       ",
            AllocKind::HostAsync => "host-async ",
            AllocKind::HostPinned => "host-pinned",
            AllocKind::Device => "device     ",
            AllocKind::Managed => "managed    ",
            AllocKind::ManagedReadMostly => "managed/rm ",
        }
    }

    /// Kinds whose freed pointers may be parked on the owning stream's
    /// release chain. All other kinds are visible to more than one stream
    /// and can only travel through the global cache.
    #[inline]
    pub fn is_stream_local(self) -> bool {
        matches!(self, AllocKind::Device | AllocKind::HostAsync)
    }

    /// Kinds allocated and freed through the GPU driver.
    #[inline]
    pub fn is_driver_backed(self) -> bool {
        matches!(
            self,
            AllocKind::HostPinned
                | AllocKind::Device
                | AllocKind::Managed
                | AllocKind::ManagedReadMostly
        )
    }

    /// Kinds the CPU may dereference directly.
    #[inline]
    pub fn is_host_accessible(self) -> bool {
        !matches!(self, AllocKind::Device)
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a cache bucket: kind, owning device, bucketed size.
///
/// `device` is 0 for kinds whose locus is not a specific GPU. `size` is
/// always the power-of-two bucket size, never the client's requested
/// size; a zero-size `AllocInfo` is never constructed (zero-size requests
/// short-circuit to the null pointer before classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocInfo {
    pub kind: AllocKind,
    pub device: i32,
    pub size: usize,
}

impl AllocInfo {
    pub fn new(kind: AllocKind, device: i32, size: usize) -> Self {
        debug_assert!(size > 0, "zero-size AllocInfo must never exist");
        debug_assert!(size.is_power_of_two(), "AllocInfo size must be bucketed");
        AllocInfo { kind, device, size }
    }
}

impl fmt::Display for AllocInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == AllocKind::Device {
            write!(f, "{}/dev{} ({} bytes)", self.kind, self.device, self.size)
        } else {
            write!(f, "{} ({} bytes)", self.kind, self.size)
        }
    }
}

/// Base alignment satisfying GPU DMA and narrow-vector SIMD loads.
pub const BASE_ALIGN: usize = 64;

/// Packet size for host memory on wide-vector CPUs: with a vector width
/// of at least 16 lanes, host buffers are rounded to `width * 8` bytes so
/// a full packet of doubles never straddles the allocation end.
#[cfg(target_arch = "x86_64")]
fn host_packet_bytes() -> usize {
    use once_cell::sync::Lazy;

    static PACKET: Lazy<usize> = Lazy::new(|| {
        let cpuid = raw_cpuid::CpuId::new();
        let avx512 = cpuid
            .get_extended_feature_info()
            .map(|f| f.has_avx512f())
            .unwrap_or(false);
        if avx512 {
            16 * std::mem::size_of::<f64>()
        } else {
            BASE_ALIGN
        }
    });
    *PACKET
}

#[cfg(not(target_arch = "x86_64"))]
fn host_packet_bytes() -> usize {
    BASE_ALIGN
}

/// Round `x` up to the next power of two, `None` on overflow.
#[inline]
pub fn round_pow2(x: usize) -> Option<usize> {
    x.checked_next_power_of_two()
}

/// Classify a requested size into its bucket size for `kind`.
///
/// The request is first rounded to a hardware-alignment multiple (64
/// bytes, or the vector packet size for host memory on wide-vector
/// CPUs), then to the next power of two. Returns `None` when the rounded
/// size does not fit in `usize`; callers treat that as out of memory.
pub fn bucket_size(kind: AllocKind, size: usize) -> Option<usize> {
    debug_assert!(size > 0);
    let align = match kind {
        AllocKind::Host | AllocKind::HostAsync => host_packet_bytes(),
        _ => BASE_ALIGN,
    };
    let aligned = size.checked_add(align - 1)? / align * align;
    round_pow2(aligned)
}
