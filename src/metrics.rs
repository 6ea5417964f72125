//! Usage accounting snapshots and byte formatting.
//!
//! The cache keeps per-kind live-byte counters and high-water marks under
//! its lock; [`MemoryMetrics`] is the point-in-time copy handed to
//! callers. Trim and leak reports format byte counts through
//! [`mem_string`].

use std::fmt;

use crate::cache::AllocKind;

/// Format a byte count for logs: `512 B`, `1.50 KiB`, `2.00 GiB`.
pub fn mem_string(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} {}", bytes, UNITS[0]);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Counters for one allocation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindMetrics {
    /// Bytes currently owned by clients (live-table entries).
    pub live_bytes: usize,
    /// Number of live allocations.
    pub live_count: usize,
    /// Historical maximum of `live_bytes`.
    pub watermark_bytes: usize,
    /// Bytes parked in the global cache, ready for reuse.
    pub cached_bytes: usize,
    /// Number of cached pointers in the global cache.
    pub cached_count: usize,
}

/// Point-in-time snapshot of the cache's per-kind accounting.
///
/// Pointers parked on per-stream release chains are in flight between
/// "live" and "cached" and appear in neither column until their stream
/// flushes them into the global cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetrics {
    pub kinds: [KindMetrics; AllocKind::COUNT],
}

impl MemoryMetrics {
    pub fn kind(&self, kind: AllocKind) -> &KindMetrics {
        &self.kinds[kind.index()]
    }

    pub fn total_live_bytes(&self) -> usize {
        self.kinds.iter().map(|k| k.live_bytes).sum()
    }

    pub fn total_cached_bytes(&self) -> usize {
        self.kinds.iter().map(|k| k.cached_bytes).sum()
    }

    /// True when nothing is live and nothing is cached.
    pub fn is_idle(&self) -> bool {
        self.kinds
            .iter()
            .all(|k| k.live_bytes == 0 && k.live_count == 0 && k.cached_bytes == 0)
    }
}

impl fmt::Display for MemoryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory usage (live / watermark / cached):")?;
        for kind in AllocKind::ALL {
            let m = self.kind(kind);
            if m.live_count == 0 && m.cached_count == 0 && m.watermark_bytes == 0 {
                continue;
            }
            writeln!(
                f,
                " - {}: {} in {} allocation{} / {} / {} in {} pointer{}",
                kind.short_name(),
                mem_string(m.live_bytes),
                m.live_count,
                if m.live_count == 1 { "" } else { "s" },
                mem_string(m.watermark_bytes),
                mem_string(m.cached_bytes),
                m.cached_count,
                if m.cached_count == 1 { "" } else { "s" },
            )?;
        }
        Ok(())
    }
}
