//! The allocation cache: the public allocate / free / migrate surface.
//!
//! [`AllocCache`] interposes a size-bucketed free-list cache between
//! clients and the raw allocators. Allocation first tries the active
//! stream's release chain (pointers that are safe to reuse on that
//! stream without any synchronization), then the global cache, and only
//! then the raw allocator, trimming and retrying once on out-of-memory.
//! Freeing never synchronizes when it can be avoided: device and
//! host-async pointers are parked on their stream's release chain and
//! only become globally reusable after [`AllocCache::flush`] and the
//! stream callback it arms.
//!
//! # Locking
//!
//! A single mutex (the malloc lock) guards the global cache, the live
//! table, the usage counters, the unmap queue and every release chain.
//! It is never held across a driver or raw-allocator call; those may
//! block or take driver-internal locks, and host callbacks re-enter the
//! cache under this lock.

use std::ffi::c_void;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{Driver, DriverError};
use crate::cache::chain::ReleaseChain;
use crate::cache::info::{bucket_size, AllocInfo, AllocKind};
use crate::error::{AllocError, AllocResult};
use crate::metrics::{mem_string, MemoryMetrics};
use crate::stream::{active_stream, Device, Stream};

/// Everything guarded by the malloc lock.
#[derive(Debug, Default)]
struct CacheState {
    /// Global cache: reusable pointers per bucket, LIFO.
    alloc_free: HashMap<AllocInfo, Vec<usize>>,
    /// Live table: every pointer currently owned by a client.
    alloc_used: HashMap<usize, AllocInfo>,
    /// Live bytes per kind; always equals the sum over the live table.
    alloc_usage: [usize; AllocKind::COUNT],
    /// Historical maximum of `alloc_usage`, per kind.
    alloc_watermark: [usize; AllocKind::COUNT],
    /// Host pointers awaiting driver unregistration, with a flag marking
    /// those that must also be freed. Filled by GPU host callbacks,
    /// which must not call driver APIs themselves.
    alloc_unmap: Vec<(bool, usize)>,
    /// Release chains, keyed by stream id.
    chains: HashMap<u64, ReleaseChain>,
}

#[derive(Debug)]
struct CacheInner {
    driver: Arc<dyn Driver>,
    devices: Vec<Device>,
    state: Mutex<CacheState>,
    trim_warned: AtomicBool,
}

/// Stream-ordered allocation cache over a [`Driver`].
///
/// The cache is a long-lived service: create one per process (or per
/// test), share it freely, and call [`shutdown`](AllocCache::shutdown)
/// when done to release cached memory and report leaks.
#[derive(Debug)]
pub struct AllocCache {
    inner: Arc<CacheInner>,
}

impl Clone for AllocCache {
    fn clone(&self) -> Self {
        AllocCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn stream_matches(stream: &Stream, info: AllocInfo) -> bool {
    match info.kind {
        AllocKind::Device => stream.is_gpu() && stream.device() == info.device,
        AllocKind::HostAsync => !stream.is_gpu(),
        _ => false,
    }
}

impl AllocCache {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let devices = (0..driver.device_count())
            .map(|i| Device { id: i as i32 })
            .collect();
        AllocCache {
            inner: Arc::new(CacheInner {
                driver,
                devices,
                state: Mutex::new(CacheState::default()),
                trim_warned: AtomicBool::new(false),
            }),
        }
    }

    /// The device registry built from the driver at construction.
    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    /// Create a stream on GPU `device`. Select it per thread with
    /// [`crate::set_active_stream`] before allocating device memory.
    pub fn create_gpu_stream(&self, device: i32) -> AllocResult<Arc<Stream>> {
        let known = usize::try_from(device)
            .map(|i| i < self.inner.devices.len())
            .unwrap_or(false);
        if !known {
            return Err(AllocError::InvalidDevice(device));
        }
        Ok(Arc::new(Stream::new_gpu(
            Arc::clone(&self.inner.driver),
            device,
        )?))
    }

    /// Create a CPU worker-pool stream for host-async memory.
    #[cfg(feature = "host-async")]
    pub fn create_host_stream(&self) -> Arc<Stream> {
        Arc::new(Stream::new_host(Arc::clone(&self.inner.driver)))
    }

    /// Allocate `size` bytes of `kind` memory.
    ///
    /// Returns a pointer owned by the caller, registered in the live
    /// table under the rounded bucket size. Zero-size requests return
    /// the null pointer without registration. Device and host-async
    /// requests need a matching active stream.
    pub fn alloc(&self, kind: AllocKind, size: usize) -> AllocResult<*mut c_void> {
        if size == 0 {
            return Ok(std::ptr::null_mut());
        }

        // Without the worker pool there are no host-async streams.
        #[cfg(not(feature = "host-async"))]
        let kind = if kind == AllocKind::HostAsync {
            AllocKind::Host
        } else {
            kind
        };

        let bucket = bucket_size(kind, size).ok_or(AllocError::OutOfMemory { kind, size })?;
        let mut info = AllocInfo::new(kind, 0, bucket);

        let stream = active_stream();
        let local_stream_id = if kind.is_stream_local() {
            let stream = stream.as_ref().ok_or(AllocError::NoActiveStream {
                op: "device/host-async allocation",
            })?;
            match kind {
                AllocKind::Device => {
                    if !stream.is_gpu() {
                        return Err(AllocError::WrongBackend {
                            op: "device allocation",
                            expected: "GPU",
                        });
                    }
                    info.device = stream.device();
                }
                AllocKind::HostAsync => {
                    if stream.is_gpu() {
                        return Err(AllocError::WrongBackend {
                            op: "host-async allocation",
                            expected: "CPU worker-pool",
                        });
                    }
                }
                _ => unreachable!("only device/host-async are stream-local"),
            }
            Some(stream.id())
        } else {
            None
        };

        let mut descr = "new allocation";
        let recycled = {
            let mut st = self.inner.state.lock()?;
            let mut found = None;

            // Pending frees on this stream are safe to reuse here without
            // any ordering hazard: stream order already serializes the
            // old use before the new one.
            if let Some(sid) = local_stream_id {
                if let Some(chain) = st.chains.get_mut(&sid) {
                    if let Some(addr) = chain.take_local(&info) {
                        descr = "reused local";
                        found = Some(addr);
                    }
                }
            }

            if found.is_none() {
                if let Some(list) = st.alloc_free.get_mut(&info) {
                    if let Some(addr) = list.pop() {
                        descr = "reused global";
                        found = Some(addr);
                    }
                }
            }
            found
        };

        let addr = match recycled {
            Some(addr) => addr,
            None => self.raw_alloc(info)?,
        };

        {
            let mut st = self.inner.state.lock()?;
            st.alloc_used.insert(addr, info);
            st.alloc_usage[info.kind.index()] += info.size;
            let usage = st.alloc_usage[info.kind.index()];
            if usage > st.alloc_watermark[info.kind.index()] {
                st.alloc_watermark[info.kind.index()] = usage;
            }
        }

        if info.kind == AllocKind::Device {
            tracing::trace!(
                "alloc(type={}, device={}, size={}): {:#x} ({})",
                info.kind,
                info.device,
                info.size,
                addr,
                descr
            );
        } else {
            tracing::trace!(
                "alloc(type={}, size={}): {:#x} ({})",
                info.kind,
                info.size,
                addr,
                descr
            );
        }
        Ok(addr as *mut c_void)
    }

    /// One raw-allocator attempt, then a trim and exactly one retry on
    /// out-of-memory. Runs with no cache lock held.
    fn raw_alloc(&self, info: AllocInfo) -> AllocResult<usize> {
        match self.try_raw_alloc(info) {
            Ok(addr) => Ok(addr),
            Err(DriverError::OutOfMemory { .. }) => {
                self.trim_inner(true)?;
                match self.try_raw_alloc(info) {
                    Ok(addr) => Ok(addr),
                    Err(DriverError::OutOfMemory { .. }) => Err(AllocError::OutOfMemory {
                        kind: info.kind,
                        size: info.size,
                    }),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_raw_alloc(&self, info: AllocInfo) -> Result<usize, DriverError> {
        let driver = &self.inner.driver;
        let ptr = match info.kind {
            AllocKind::Host | AllocKind::HostAsync => driver.host_alloc(info.size)?,
            AllocKind::HostPinned => driver.pinned_alloc(info.size)?,
            AllocKind::Device => driver.device_alloc(info.device, info.size)?,
            AllocKind::Managed => driver.managed_alloc(info.size, false)?,
            AllocKind::ManagedReadMostly => driver.managed_alloc(info.size, true)?,
        };
        Ok(ptr as usize)
    }

    /// Relinquish ownership of `ptr`. Null is a no-op.
    ///
    /// Host pointers go straight into the global cache. Device and
    /// host-async pointers are parked on the matching active stream's
    /// release chain and stay unavailable to other streams until
    /// [`flush`](AllocCache::flush) hands them to the global cache. Any
    /// other case (globally-accessible kinds, or a missing/mismatched
    /// stream) synchronizes all devices first; in-flight work on any
    /// stream may still be reading the pointer.
    pub fn free(&self, ptr: *mut c_void) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        let stream = active_stream();

        enum Route {
            Done,
            SyncFallback,
            DrainUnmap(Vec<(bool, usize)>),
        }

        let (info, route) = {
            let mut st = self.inner.state.lock()?;
            let info = st
                .alloc_used
                .remove(&addr)
                .ok_or(AllocError::UnknownPointer { addr })?;
            st.alloc_usage[info.kind.index()] -= info.size;

            let route = if info.kind == AllocKind::Host {
                // No async hazard for plain host memory.
                st.alloc_free.entry(info).or_default().push(addr);
                Route::Done
            } else if let Some(stream) = stream.as_ref().filter(|s| stream_matches(s, info)) {
                st.chains
                    .entry(stream.id())
                    .or_default()
                    .push_pending(info, addr);
                if stream.is_gpu() {
                    Route::DrainUnmap(std::mem::take(&mut st.alloc_unmap))
                } else {
                    Route::Done
                }
            } else {
                Route::SyncFallback
            };
            (info, route)
        };

        match route {
            Route::Done => {}
            Route::DrainUnmap(pending) => self.process_unmap(pending)?,
            Route::SyncFallback => {
                // The pointer is visible beyond one stream (or was freed
                // outside its stream); only a full flush makes the free
                // safe. This path should be rare.
                if let Err(e) = self.inner.driver.sync_all() {
                    let mut st = self.inner.state.lock()?;
                    st.alloc_used.insert(addr, info);
                    st.alloc_usage[info.kind.index()] += info.size;
                    return Err(e.into());
                }
                let mut st = self.inner.state.lock()?;
                st.alloc_free.entry(info).or_default().push(addr);
            }
        }

        if info.kind == AllocKind::Device {
            tracing::trace!(
                "free({:#x}, type={}, device={}, size={})",
                addr,
                info.kind,
                info.device,
                info.size
            );
        } else {
            tracing::trace!("free({:#x}, type={}, size={})", addr, info.kind, info.size);
        }
        Ok(())
    }

    /// Unregister queued host pointers and free those marked for it.
    /// Must be called with no cache lock held.
    fn process_unmap(&self, pending: Vec<(bool, usize)>) -> AllocResult<()> {
        for (also_free, addr) in pending {
            self.inner.driver.host_unregister(addr as *mut c_void);
            if also_free {
                self.free(addr as *mut c_void)?;
            }
        }
        Ok(())
    }

    /// Schedule reclamation of the active stream's pending frees.
    ///
    /// Seals the stream's pending batch and arms a host callback behind
    /// everything currently submitted to the stream. When the callback
    /// runs, the stream has executed past every prior use of the sealed
    /// pointers, and they move into the global cache for any stream to
    /// reuse. No active stream, or nothing pending, is a no-op.
    pub fn flush(&self) -> AllocResult<()> {
        let Some(stream) = active_stream() else {
            return Ok(());
        };

        let sealed = {
            let mut st = self.inner.state.lock()?;
            match st.chains.get_mut(&stream.id()) {
                Some(chain) if chain.pending_count() > 0 => {
                    let n = chain.pending_count();
                    Some((chain.seal(), n))
                }
                _ => None,
            }
        };
        let Some((seq, n)) = sealed else {
            return Ok(());
        };

        tracing::trace!(
            "flush(): scheduling {} deallocation{}",
            n,
            if n == 1 { "" } else { "s" }
        );

        let inner = Arc::downgrade(&self.inner);
        let sid = stream.id();
        stream.enqueue_host_fn(Box::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let Ok(mut st) = inner.state.lock() else {
                return;
            };
            let batch = match st.chains.get_mut(&sid) {
                Some(chain) => chain.reclaim(seq),
                None => return,
            };
            for (info, list) in batch {
                st.alloc_free.entry(info).or_default().extend(list);
            }
        }))
    }

    /// Move a buffer to `kind` memory; `move_src` releases the source.
    ///
    /// `Host ↔ HostAsync` moves rewrite the live-table entry in place
    /// and return the input pointer. Everything else copies into a fresh
    /// allocation on the active GPU stream: host sources/destinations
    /// are registered for DMA and queued for unregistration (and, on a
    /// move, deferred freeing) through the unmap queue once the copy has
    /// drained. Migrations touching host-async memory on a GPU path are
    /// unsupported.
    pub fn migrate(
        &self,
        ptr: *mut c_void,
        kind: AllocKind,
        move_src: bool,
    ) -> AllocResult<*mut c_void> {
        let stream = active_stream().ok_or(AllocError::NoActiveStream { op: "migration" })?;
        let addr = ptr as usize;

        #[cfg(not(feature = "host-async"))]
        let kind = if kind == AllocKind::HostAsync {
            AllocKind::Host
        } else {
            kind
        };

        let info = {
            let st = self.inner.state.lock()?;
            *st.alloc_used
                .get(&addr)
                .ok_or(AllocError::UnknownPointer { addr })?
        };

        #[cfg(feature = "host-async")]
        if move_src
            && matches!(
                (info.kind, kind),
                (AllocKind::Host, AllocKind::HostAsync) | (AllocKind::HostAsync, AllocKind::Host)
            )
        {
            // The bytes already satisfy both kinds; rewrite in place and
            // keep the usage counters in step with the live table.
            let mut st = self.inner.state.lock()?;
            if let Some(entry) = st.alloc_used.get_mut(&addr) {
                entry.kind = kind;
            }
            st.alloc_usage[info.kind.index()] -= info.size;
            st.alloc_usage[kind.index()] += info.size;
            let usage = st.alloc_usage[kind.index()];
            if usage > st.alloc_watermark[kind.index()] {
                st.alloc_watermark[kind.index()] = usage;
            }
            tracing::trace!("migrate({:#x}): {} -> {} (kind rewrite)", addr, info.kind, kind);
            return Ok(ptr);
        }

        // Maybe nothing needs to be done.
        if info.kind == kind && (kind != AllocKind::Device || info.device == stream.device()) {
            return Ok(ptr);
        }

        if !stream.is_gpu() {
            return Err(AllocError::WrongBackend {
                op: "migration",
                expected: "GPU",
            });
        }
        if kind == AllocKind::HostAsync || info.kind == AllocKind::HostAsync {
            return Err(AllocError::UnsupportedMigration {
                from: info.kind,
                to: kind,
            });
        }

        let handle = stream.handle().expect("GPU stream has a driver handle");
        let dst_ptr = self.alloc(kind, info.size)?;
        tracing::trace!(
            "migrate({:#x} -> {:#x}, {} -> {})",
            addr,
            dst_ptr as usize,
            info.kind,
            kind
        );

        let staged = (|| -> AllocResult<bool> {
            let driver = &self.inner.driver;
            if info.kind == AllocKind::Host {
                // Host -> GPU-accessible: pin the source for DMA. The
                // unpin (plus the deferred free on a move) is recorded by
                // a host callback and processed on the next safe path;
                // the callback itself may not call driver APIs.
                driver.host_register(ptr, info.size)?;
                driver.memcpy_async(dst_ptr, ptr as *const c_void, info.size, handle)?;
                let inner = Arc::downgrade(&self.inner);
                driver.launch_host_func(
                    handle,
                    Box::new(move || {
                        if let Some(inner) = inner.upgrade() {
                            if let Ok(mut st) = inner.state.lock() {
                                st.alloc_unmap.push((move_src, addr));
                            }
                        }
                    }),
                )?;
                Ok(false)
            } else if kind == AllocKind::Host {
                // GPU-accessible -> host: pin the fresh destination for
                // the DMA copy and queue its unpin; the GPU-side source
                // can be freed right away (it defers via the chain).
                driver.host_register(dst_ptr, info.size)?;
                driver.memcpy_async(dst_ptr, ptr as *const c_void, info.size, handle)?;
                let inner = Arc::downgrade(&self.inner);
                let dst = dst_ptr as usize;
                driver.launch_host_func(
                    handle,
                    Box::new(move || {
                        if let Some(inner) = inner.upgrade() {
                            if let Ok(mut st) = inner.state.lock() {
                                st.alloc_unmap.push((false, dst));
                            }
                        }
                    }),
                )?;
                Ok(move_src)
            } else {
                driver.memcpy_async(dst_ptr, ptr as *const c_void, info.size, handle)?;
                Ok(move_src)
            }
        })();

        match staged {
            Ok(free_src_now) => {
                if free_src_now {
                    self.free(ptr)?;
                }
                Ok(dst_ptr)
            }
            Err(e) => {
                let _ = self.free(dst_ptr);
                Err(e)
            }
        }
    }

    /// Asynchronously migrate a managed range towards `device` on the
    /// active GPU stream. `device == -1` targets the CPU, `-2` broadcasts
    /// to every registered device.
    pub fn prefetch(&self, ptr: *mut c_void, device: i32) -> AllocResult<()> {
        let stream = active_stream().ok_or(AllocError::NoActiveStream { op: "prefetch" })?;
        if !stream.is_gpu() {
            return Err(AllocError::WrongBackend {
                op: "prefetch",
                expected: "GPU",
            });
        }

        let target = if device == -1 || device == -2 {
            device
        } else {
            let idx =
                usize::try_from(device).map_err(|_| AllocError::InvalidDevice(device))?;
            self.inner
                .devices
                .get(idx)
                .ok_or(AllocError::InvalidDevice(device))?
                .id
        };

        let addr = ptr as usize;
        let info = {
            let st = self.inner.state.lock()?;
            *st.alloc_used
                .get(&addr)
                .ok_or(AllocError::UnknownPointer { addr })?
        };
        if !matches!(info.kind, AllocKind::Managed | AllocKind::ManagedReadMostly) {
            return Err(AllocError::InvalidKindForPrefetch(info.kind));
        }

        let handle = stream.handle().expect("GPU stream has a driver handle");
        if target == -2 {
            for device in &self.inner.devices {
                self.inner
                    .driver
                    .prefetch_async(ptr, info.size, device.id, handle)?;
            }
        } else {
            self.inner
                .driver
                .prefetch_async(ptr, info.size, target, handle)?;
        }
        Ok(())
    }

    /// Release all cached memory back to the underlying allocators.
    ///
    /// Pointers parked on per-stream release chains are not affected;
    /// they reach the global cache (and the next trim) once their stream
    /// flushes.
    pub fn trim(&self) -> AllocResult<()> {
        self.trim_inner(false)
    }

    fn trim_inner(&self, warn: bool) -> AllocResult<()> {
        if warn && !self.inner.trim_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "trim(): the allocation cache had to be flushed to satisfy an allocation \
                 that would otherwise have failed. This is an expensive operation with a \
                 negative effect on performance; consider reducing the working set of the \
                 computation. This warning is only displayed once."
            );
        }

        let (freed, unmap) = {
            let mut st = self.inner.state.lock()?;
            (
                std::mem::take(&mut st.alloc_free),
                std::mem::take(&mut st.alloc_unmap),
            )
        };

        self.process_unmap(unmap)?;

        let mut trim_count = [0usize; AllocKind::COUNT];
        let mut trim_size = [0usize; AllocKind::COUNT];
        let driver = &self.inner.driver;
        for (info, list) in freed {
            trim_count[info.kind.index()] += list.len();
            trim_size[info.kind.index()] += info.size * list.len();
            for addr in list {
                let p = addr as *mut c_void;
                match info.kind {
                    AllocKind::Device | AllocKind::Managed | AllocKind::ManagedReadMostly => {
                        driver.device_free(p)
                    }
                    AllocKind::HostPinned => driver.pinned_free(p),
                    AllocKind::Host | AllocKind::HostAsync => driver.host_free(p, info.size),
                }
            }
        }

        if trim_count.iter().sum::<usize>() > 0 {
            tracing::debug!("trim(): freed");
            for kind in AllocKind::ALL {
                let count = trim_count[kind.index()];
                if count == 0 {
                    continue;
                }
                tracing::debug!(
                    " - {} memory: {} in {} allocation{}",
                    kind.short_name(),
                    mem_string(trim_size[kind.index()]),
                    count,
                    if count == 1 { "" } else { "s" }
                );
            }
        }
        Ok(())
    }

    /// Trim the cache, then report every still-live pointer as a leak.
    ///
    /// Leaked pointers are reported but deliberately not freed: freeing
    /// them could race with async work that still reads them.
    pub fn shutdown(&self) -> AllocResult<()> {
        self.trim_inner(false)?;

        let mut leak_count = [0usize; AllocKind::COUNT];
        let mut leak_size = [0usize; AllocKind::COUNT];
        {
            let st = self.inner.state.lock()?;
            for info in st.alloc_used.values() {
                leak_count[info.kind.index()] += 1;
                leak_size[info.kind.index()] += info.size;
            }
        }

        if leak_count.iter().sum::<usize>() > 0 {
            tracing::warn!("shutdown(): leaked");
            for kind in AllocKind::ALL {
                let count = leak_count[kind.index()];
                if count == 0 {
                    continue;
                }
                tracing::warn!(
                    " - {} memory: {} in {} allocation{}",
                    kind.short_name(),
                    mem_string(leak_size[kind.index()]),
                    count,
                    if count == 1 { "" } else { "s" }
                );
            }
        }
        Ok(())
    }

    /// Live bytes of `kind` currently owned by clients.
    pub fn usage(&self, kind: AllocKind) -> AllocResult<usize> {
        Ok(self.inner.state.lock()?.alloc_usage[kind.index()])
    }

    /// Historical maximum of [`usage`](AllocCache::usage) for `kind`.
    pub fn watermark(&self, kind: AllocKind) -> AllocResult<usize> {
        Ok(self.inner.state.lock()?.alloc_watermark[kind.index()])
    }

    /// Point-in-time snapshot of the per-kind accounting.
    pub fn metrics(&self) -> AllocResult<MemoryMetrics> {
        let st = self.inner.state.lock()?;
        let mut metrics = MemoryMetrics::default();
        for (kind, m) in AllocKind::ALL.iter().zip(metrics.kinds.iter_mut()) {
            m.live_bytes = st.alloc_usage[kind.index()];
            m.watermark_bytes = st.alloc_watermark[kind.index()];
        }
        for info in st.alloc_used.values() {
            metrics.kinds[info.kind.index()].live_count += 1;
        }
        for (info, list) in &st.alloc_free {
            let m = &mut metrics.kinds[info.kind.index()];
            m.cached_bytes += info.size * list.len();
            m.cached_count += list.len();
        }
        Ok(metrics)
    }

    /// Debugging aid: panic if the internal accounting is inconsistent.
    ///
    /// Checks that per-kind usage equals the live-table sum, that
    /// watermarks never lag usage, and that no live pointer also sits in
    /// a cache bucket or release chain.
    pub fn check_invariants(&self) {
        let st = self.inner.state.lock().expect("malloc lock poisoned");

        let mut expected = [0usize; AllocKind::COUNT];
        for info in st.alloc_used.values() {
            expected[info.kind.index()] += info.size;
        }
        assert_eq!(
            st.alloc_usage, expected,
            "per-kind usage out of step with the live table"
        );
        for kind in AllocKind::ALL {
            assert!(
                st.alloc_watermark[kind.index()] >= st.alloc_usage[kind.index()],
                "watermark below usage for {kind}"
            );
        }
        for addr in st.alloc_used.keys() {
            assert!(
                !st.alloc_free.values().any(|list| list.contains(addr)),
                "live pointer {addr:#x} also cached globally"
            );
            assert!(
                !st.chains.values().any(|chain| chain.contains(*addr)),
                "live pointer {addr:#x} also parked on a release chain"
            );
        }
    }
}
