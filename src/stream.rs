//! Streams and ambient stream selection.
//!
//! A [`Stream`] is an ordered queue of asynchronous work on one backend:
//! a GPU stream owned by the driver, or (with the `host-async` feature) a
//! CPU worker-pool queue. Host functions submitted at a point run only
//! after all work submitted before that point has completed; the
//! allocation cache builds its deferred-reclamation protocol on exactly
//! this property.
//!
//! Allocation and free calls do not take a stream parameter. Instead the
//! active stream is ambient, per-thread state selected with
//! [`set_active_stream`] before evaluating kernels, in the way a JIT sets
//! its target device once per dispatch.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{Driver, HostFn, StreamHandle};
use crate::error::AllocResult;

#[cfg(feature = "host-async")]
use crate::worker::WorkerQueue;

/// Entry in the device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub id: i32,
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
enum StreamKind {
    Gpu { handle: StreamHandle },
    #[cfg(feature = "host-async")]
    HostPool { queue: WorkerQueue },
}

/// One ordered work queue on a GPU or on the CPU worker pool.
///
/// Streams are created through the cache (`create_gpu_stream` /
/// `create_host_stream`) so their release chains are registered with the
/// cache state. Flush a stream and synchronize it before dropping it;
/// pointers parked on its release chain are otherwise only recovered at
/// shutdown.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    device: i32,
    kind: StreamKind,
    driver: Arc<dyn Driver>,
}

impl Stream {
    pub(crate) fn new_gpu(driver: Arc<dyn Driver>, device: i32) -> AllocResult<Self> {
        let handle = driver.create_stream(device)?;
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("created GPU stream {} on device {}", id, device);
        Ok(Stream {
            id,
            device,
            kind: StreamKind::Gpu { handle },
            driver,
        })
    }

    #[cfg(feature = "host-async")]
    pub(crate) fn new_host(driver: Arc<dyn Driver>) -> Self {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("created host worker stream {}", id);
        Stream {
            id,
            device: 0,
            kind: StreamKind::HostPool {
                queue: WorkerQueue::new(id),
            },
            driver,
        }
    }

    /// Cache-internal stream identity (release-chain key).
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.kind, StreamKind::Gpu { .. })
    }

    /// Driver handle for GPU streams, `None` for worker-pool streams.
    pub(crate) fn handle(&self) -> Option<StreamHandle> {
        match &self.kind {
            StreamKind::Gpu { handle } => Some(*handle),
            #[cfg(feature = "host-async")]
            StreamKind::HostPool { .. } => None,
        }
    }

    /// Submit a host function behind all prior work on this stream.
    pub(crate) fn enqueue_host_fn(&self, f: HostFn) -> AllocResult<()> {
        match &self.kind {
            StreamKind::Gpu { handle } => {
                self.driver.launch_host_func(*handle, f)?;
            }
            #[cfg(feature = "host-async")]
            StreamKind::HostPool { queue } => queue.enqueue(f),
        }
        Ok(())
    }

    /// Block until the stream has executed everything submitted so far.
    pub fn sync(&self) -> AllocResult<()> {
        match &self.kind {
            StreamKind::Gpu { handle } => {
                self.driver.sync_stream(*handle)?;
            }
            #[cfg(feature = "host-async")]
            StreamKind::HostPool { queue } => queue.sync(),
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let StreamKind::Gpu { handle } = &self.kind {
            self.driver.destroy_stream(*handle);
        }
        tracing::debug!("destroyed stream {}", self.id);
    }
}

thread_local! {
    static ACTIVE_STREAM: RefCell<Option<Arc<Stream>>> = const { RefCell::new(None) };
}

/// Select the calling thread's active stream (or clear it with `None`).
pub fn set_active_stream(stream: Option<Arc<Stream>>) {
    ACTIVE_STREAM.with(|cell| *cell.borrow_mut() = stream);
}

/// The calling thread's active stream, if any.
pub fn active_stream() -> Option<Arc<Stream>> {
    ACTIVE_STREAM.with(|cell| cell.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimDriver;

    #[test]
    fn active_stream_is_per_thread() {
        let driver: Arc<dyn Driver> = Arc::new(SimDriver::new(1));
        let stream = Arc::new(Stream::new_gpu(Arc::clone(&driver), 0).unwrap());

        set_active_stream(Some(Arc::clone(&stream)));
        assert_eq!(active_stream().unwrap().id(), stream.id());

        let other = std::thread::spawn(|| active_stream().is_none())
            .join()
            .unwrap();
        assert!(other, "a fresh thread has no active stream");

        set_active_stream(None);
        assert!(active_stream().is_none());
    }

    #[test]
    fn gpu_stream_reports_backend_and_device() {
        let driver: Arc<dyn Driver> = Arc::new(SimDriver::new(2));
        let stream = Stream::new_gpu(driver, 1).unwrap();
        assert!(stream.is_gpu());
        assert_eq!(stream.device(), 1);
        assert!(stream.handle().is_some());
    }

    #[cfg(feature = "host-async")]
    #[test]
    fn host_stream_orders_enqueued_functions() {
        use std::sync::Mutex;

        let driver: Arc<dyn Driver> = Arc::new(SimDriver::new(1));
        let stream = Stream::new_host(driver);
        assert!(!stream.is_gpu());
        assert!(stream.handle().is_none());

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            stream
                .enqueue_host_fn(Box::new(move || log.lock().unwrap().push(i)))
                .unwrap();
        }
        stream.sync().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
