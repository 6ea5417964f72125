//! Simulated driver for tests and GPU-less development.
//!
//! Models the one property the cache depends on: a stream is a FIFO of
//! asynchronous work, and a host function submitted at point P runs only
//! after everything before P. Submitted copies and host functions are
//! queued per stream and executed, in order, when the stream (or device)
//! is synchronized. "Device" memory is ordinary host memory so migration
//! copies are observable from tests.
//!
//! The simulator also keeps call counters, registration bookkeeping and
//! allocation fault injection so tests can drive the out-of-memory retry
//! path and assert on unmap behavior.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Mutex;

use crate::backend::driver::{Driver, DriverError, DriverResult, HostFn, StreamHandle};

const SIM_ALIGN: usize = 64;

enum SimOp {
    // Addresses stored as usize so the queue stays Send.
    Copy { dst: usize, src: usize, size: usize },
    Host(HostFn),
}

struct SimStream {
    device: i32,
    queue: Vec<SimOp>,
}

#[derive(Default)]
struct SimState {
    streams: HashMap<usize, SimStream>,
    next_stream: usize,
    // Every live raw allocation, address -> layout.
    allocations: HashMap<usize, Layout>,
    registered: HashMap<usize, usize>,
    fail_host_allocs: usize,
    fail_device_allocs: usize,
    // Call counters for test assertions.
    host_allocs: usize,
    device_allocs: usize,
    pinned_allocs: usize,
    managed_allocs: usize,
    frees: usize,
    register_calls: usize,
    unregister_calls: usize,
    prefetches: Vec<(usize, i32)>,
}

/// In-process [`Driver`] with deterministic, sync-driven streams.
pub struct SimDriver {
    devices: usize,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("devices", &self.devices)
            .finish()
    }
}

impl SimDriver {
    pub fn new(devices: usize) -> Self {
        SimDriver {
            devices,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make the next `n` host allocations fail with out-of-memory.
    pub fn fail_next_host_allocs(&self, n: usize) {
        self.state.lock().unwrap().fail_host_allocs = n;
    }

    /// Make the next `n` device allocations fail with out-of-memory.
    pub fn fail_next_device_allocs(&self, n: usize) {
        self.state.lock().unwrap().fail_device_allocs = n;
    }

    /// Raw allocations currently outstanding (not yet freed).
    pub fn outstanding_allocs(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    /// Host ranges currently registered for DMA.
    pub fn registered_count(&self) -> usize {
        self.state.lock().unwrap().registered.len()
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().unwrap().register_calls
    }

    pub fn unregister_calls(&self) -> usize {
        self.state.lock().unwrap().unregister_calls
    }

    /// Total raw allocation calls, all kinds.
    pub fn alloc_calls(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.host_allocs + st.device_allocs + st.pinned_allocs + st.managed_allocs
    }

    pub fn free_calls(&self) -> usize {
        self.state.lock().unwrap().frees
    }

    /// Prefetch targets issued so far, `(address, device)` in order.
    pub fn prefetch_log(&self) -> Vec<(usize, i32)> {
        self.state.lock().unwrap().prefetches.clone()
    }

    fn raw_alloc(&self, size: usize) -> DriverResult<*mut c_void> {
        let layout = Layout::from_size_align(size.max(1), SIM_ALIGN)
            .map_err(|e| DriverError::Api(e.to_string()))?;
        // SAFETY: layout has nonzero size and valid alignment.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(DriverError::OutOfMemory { size });
        }
        self.state
            .lock()
            .unwrap()
            .allocations
            .insert(ptr as usize, layout);
        Ok(ptr as *mut c_void)
    }

    fn raw_free(&self, ptr: *mut c_void) {
        let layout = {
            let mut st = self.state.lock().unwrap();
            st.frees += 1;
            st.allocations.remove(&(ptr as usize))
        };
        match layout {
            // SAFETY: the pointer came out of raw_alloc with this layout.
            Some(layout) => unsafe { dealloc(ptr as *mut u8, layout) },
            None => panic!("SimDriver: free of unknown pointer {:p}", ptr),
        }
    }

    /// Pop-and-run ops of `stream` until its queue is empty. Ops run
    /// without the simulator lock held so host functions may re-enter
    /// cache (though never driver) state.
    fn drain_stream(&self, stream: usize) {
        loop {
            let op = {
                let mut st = self.state.lock().unwrap();
                match st.streams.get_mut(&stream) {
                    Some(s) if !s.queue.is_empty() => Some(s.queue.remove(0)),
                    _ => None,
                }
            };
            match op {
                Some(SimOp::Copy { dst, src, size }) => unsafe {
                    // SAFETY: both ranges are live sim allocations; the
                    // cache never submits overlapping copies.
                    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
                },
                Some(SimOp::Host(f)) => f(),
                None => break,
            }
        }
    }

    fn streams_on(&self, device: Option<i32>) -> Vec<usize> {
        let st = self.state.lock().unwrap();
        st.streams
            .iter()
            .filter(|(_, s)| device.map_or(true, |d| s.device == d))
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Driver for SimDriver {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn host_alloc(&self, size: usize) -> DriverResult<*mut c_void> {
        {
            let mut st = self.state.lock().unwrap();
            st.host_allocs += 1;
            if st.fail_host_allocs > 0 {
                st.fail_host_allocs -= 1;
                return Err(DriverError::OutOfMemory { size });
            }
        }
        self.raw_alloc(size)
    }

    fn host_free(&self, ptr: *mut c_void, _size: usize) {
        self.raw_free(ptr);
    }

    fn pinned_alloc(&self, size: usize) -> DriverResult<*mut c_void> {
        self.state.lock().unwrap().pinned_allocs += 1;
        self.raw_alloc(size)
    }

    fn pinned_free(&self, ptr: *mut c_void) {
        self.raw_free(ptr);
    }

    fn device_alloc(&self, device: i32, size: usize) -> DriverResult<*mut c_void> {
        {
            let mut st = self.state.lock().unwrap();
            if device < 0 || device as usize >= self.devices {
                return Err(DriverError::InvalidDevice(device));
            }
            st.device_allocs += 1;
            if st.fail_device_allocs > 0 {
                st.fail_device_allocs -= 1;
                return Err(DriverError::OutOfMemory { size });
            }
        }
        self.raw_alloc(size)
    }

    fn device_free(&self, ptr: *mut c_void) {
        self.raw_free(ptr);
    }

    fn managed_alloc(&self, size: usize, _read_mostly: bool) -> DriverResult<*mut c_void> {
        self.state.lock().unwrap().managed_allocs += 1;
        self.raw_alloc(size)
    }

    fn host_register(&self, ptr: *mut c_void, size: usize) -> DriverResult<()> {
        let mut st = self.state.lock().unwrap();
        st.register_calls += 1;
        if st.registered.insert(ptr as usize, size).is_some() {
            return Err(DriverError::Api(format!(
                "host range {:p} registered twice",
                ptr
            )));
        }
        Ok(())
    }

    fn host_unregister(&self, ptr: *mut c_void) {
        let mut st = self.state.lock().unwrap();
        st.unregister_calls += 1;
        if st.registered.remove(&(ptr as usize)).is_none() {
            panic!("SimDriver: unregister of unregistered pointer {:p}", ptr);
        }
    }

    fn create_stream(&self, device: i32) -> DriverResult<StreamHandle> {
        let mut st = self.state.lock().unwrap();
        if device < 0 || device as usize >= self.devices {
            return Err(DriverError::InvalidDevice(device));
        }
        let id = st.next_stream;
        st.next_stream += 1;
        st.streams.insert(
            id,
            SimStream {
                device,
                queue: Vec::new(),
            },
        );
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) {
        self.drain_stream(stream.0);
        self.state.lock().unwrap().streams.remove(&stream.0);
    }

    fn memcpy_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        let mut st = self.state.lock().unwrap();
        let s = st
            .streams
            .get_mut(&stream.0)
            .ok_or_else(|| DriverError::Api(format!("unknown stream {}", stream.0)))?;
        s.queue.push(SimOp::Copy {
            dst: dst as usize,
            src: src as usize,
            size,
        });
        Ok(())
    }

    fn launch_host_func(&self, stream: StreamHandle, f: HostFn) -> DriverResult<()> {
        let mut st = self.state.lock().unwrap();
        let s = st
            .streams
            .get_mut(&stream.0)
            .ok_or_else(|| DriverError::Api(format!("unknown stream {}", stream.0)))?;
        s.queue.push(SimOp::Host(f));
        Ok(())
    }

    fn prefetch_async(
        &self,
        ptr: *mut c_void,
        _size: usize,
        device: i32,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        let mut st = self.state.lock().unwrap();
        if !st.streams.contains_key(&stream.0) {
            return Err(DriverError::Api(format!("unknown stream {}", stream.0)));
        }
        st.prefetches.push((ptr as usize, device));
        Ok(())
    }

    fn sync_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        self.drain_stream(stream.0);
        Ok(())
    }

    fn sync_device(&self, device: i32) -> DriverResult<()> {
        for id in self.streams_on(Some(device)) {
            self.drain_stream(id);
        }
        Ok(())
    }

    fn sync_all(&self) -> DriverResult<()> {
        for id in self.streams_on(None) {
            self.drain_stream(id);
        }
        Ok(())
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        // Leak-check is the cache's job (shutdown); here we only release
        // what is left so the simulator itself never leaks.
        let allocations: Vec<(usize, Layout)> = self
            .state
            .lock()
            .map(|st| st.allocations.iter().map(|(p, l)| (*p, *l)).collect())
            .unwrap_or_default();
        for (ptr, layout) in allocations {
            // SAFETY: recorded at allocation time, freed exactly once here.
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ops_run_in_order_at_sync() {
        let driver = SimDriver::new(1);
        let stream = driver.create_stream(0).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            driver
                .launch_host_func(stream, Box::new(move || log.lock().unwrap().push(i)))
                .unwrap();
        }
        assert!(log.lock().unwrap().is_empty(), "nothing runs before sync");

        driver.sync_stream(stream).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn copies_are_observable_after_sync() {
        let driver = SimDriver::new(1);
        let stream = driver.create_stream(0).unwrap();

        let src = driver.host_alloc(64).unwrap();
        let dst = driver.device_alloc(0, 64).unwrap();
        unsafe { std::ptr::write_bytes(src as *mut u8, 0xab, 64) };

        driver.memcpy_async(dst, src, 64, stream).unwrap();
        driver.sync_stream(stream).unwrap();

        let byte = unsafe { *(dst as *const u8) };
        assert_eq!(byte, 0xab);

        driver.host_free(src, 64);
        driver.device_free(dst);
        assert_eq!(driver.outstanding_allocs(), 0);
    }

    #[test]
    fn fault_injection_counts_down() {
        let driver = SimDriver::new(1);
        driver.fail_next_device_allocs(1);
        assert!(matches!(
            driver.device_alloc(0, 128),
            Err(DriverError::OutOfMemory { size: 128 })
        ));
        let ptr = driver.device_alloc(0, 128).unwrap();
        driver.device_free(ptr);
    }

    #[test]
    fn host_funcs_may_touch_foreign_state() {
        // The drain loop releases the simulator lock before running a
        // host function; a function that calls back into counters must
        // not deadlock.
        let driver = Arc::new(SimDriver::new(1));
        let stream = driver.create_stream(0).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&driver);
        let s = Arc::clone(&seen);
        driver
            .launch_host_func(
                stream,
                Box::new(move || {
                    s.store(d.register_calls(), Ordering::SeqCst);
                }),
            )
            .unwrap();
        driver.sync_stream(stream).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_device_is_rejected() {
        let driver = SimDriver::new(2);
        assert!(matches!(
            driver.device_alloc(2, 64),
            Err(DriverError::InvalidDevice(2))
        ));
        assert!(matches!(
            driver.create_stream(-1),
            Err(DriverError::InvalidDevice(-1))
        ));
    }
}
