//! Per-stream release chains: batches of frees awaiting stream drain.
//!
//! Freeing device or host-async memory must not synchronize with the
//! owning stream; in-flight kernels may still read the pointer. Instead
//! the free is parked in the stream's release chain. The *head* batch
//! collects pending frees. A flush seals the head behind a fresh one and
//! schedules a host callback on the stream; when the callback runs the
//! stream has executed past every use of the sealed pointers, and the
//! batch is reclaimed into the global cache.
//!
//! Pointers anywhere in the chain (pending or sealed) are safe to hand
//! back to allocations on the *same* stream: stream order already places
//! the new use after the old one. That is the local-recycle fast path.

use std::collections::{HashMap, VecDeque};

use crate::cache::info::AllocInfo;

/// One batch of frees, identified by a sequence number so the stream
/// callback can reclaim exactly the batch it was armed with.
#[derive(Debug)]
pub(crate) struct ChainBatch {
    pub seq: u64,
    pub entries: HashMap<AllocInfo, Vec<usize>>,
}

impl ChainBatch {
    fn new(seq: u64) -> Self {
        ChainBatch {
            seq,
            entries: HashMap::new(),
        }
    }

    fn count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Ordered batches of deferred frees for one stream.
///
/// Front of the deque is the head (pending) batch; batches behind it are
/// sealed and owned by an in-flight stream callback each.
#[derive(Debug, Default)]
pub(crate) struct ReleaseChain {
    batches: VecDeque<ChainBatch>,
    next_seq: u64,
}

impl ReleaseChain {
    /// Park a freed pointer in the head batch (created lazily).
    pub fn push_pending(&mut self, info: AllocInfo, addr: usize) {
        if self.batches.is_empty() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.batches.push_front(ChainBatch::new(seq));
        }
        self.batches
            .front_mut()
            .expect("head batch exists")
            .entries
            .entry(info)
            .or_default()
            .push(addr);
    }

    /// Recycle a pointer for the same stream: newest batch first, LIFO
    /// within a bucket.
    pub fn take_local(&mut self, info: &AllocInfo) -> Option<usize> {
        for batch in &mut self.batches {
            if let Some(list) = batch.entries.get_mut(info) {
                if let Some(addr) = list.pop() {
                    return Some(addr);
                }
            }
        }
        None
    }

    /// Frees pending in the head batch (not yet sealed).
    pub fn pending_count(&self) -> usize {
        self.batches.front().map_or(0, ChainBatch::count)
    }

    /// Seal the head batch behind a fresh empty head and return its
    /// sequence number for the stream callback. Call only when
    /// `pending_count() > 0`.
    pub fn seal(&mut self) -> u64 {
        debug_assert!(self.pending_count() > 0, "sealing an empty head batch");
        let sealed = self.batches.front().expect("head batch exists").seq;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.batches.push_front(ChainBatch::new(seq));
        sealed
    }

    /// Detach the sealed batch `seq` for reclamation into the global
    /// cache. Allocations may have drained some or all of its buckets in
    /// the meantime, so the result can be empty.
    pub fn reclaim(&mut self, seq: u64) -> HashMap<AllocInfo, Vec<usize>> {
        match self.batches.iter().position(|b| b.seq == seq) {
            Some(idx) => {
                self.batches
                    .remove(idx)
                    .expect("position came from this deque")
                    .entries
            }
            None => HashMap::new(),
        }
    }

    /// Total pointers parked anywhere in the chain.
    pub fn total_count(&self) -> usize {
        self.batches.iter().map(ChainBatch::count).sum()
    }

    /// True if `addr` is parked in any batch (invariant checks).
    pub fn contains(&self, addr: usize) -> bool {
        self.batches
            .iter()
            .any(|b| b.entries.values().any(|list| list.contains(&addr)))
    }
}
