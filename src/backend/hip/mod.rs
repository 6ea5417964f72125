//! HIP runtime driver for AMD GPUs.
//!
//! Implements [`Driver`] over the HIP runtime. Device selection in HIP
//! is per-thread state, so allocation and synchronization wrappers set
//! the device immediately before the call on the same thread; no
//! process-wide lock is needed for that pairing.

mod ffi;

use std::ffi::{c_void, CStr};

use crate::backend::driver::{Driver, DriverError, DriverResult, HostFn, StreamHandle};

fn error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a static NUL-terminated string
    // for every status code.
    unsafe {
        let ptr = ffi::hipGetErrorString(code);
        if ptr.is_null() {
            format!("HIP error {}", code)
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn check(code: i32, what: &str) -> DriverResult<()> {
    if code == ffi::HIP_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Api(format!(
            "{} failed: {} ({})",
            what,
            error_string(code),
            code
        )))
    }
}

fn check_alloc(code: i32, ptr: *mut c_void, size: usize, what: &str) -> DriverResult<()> {
    if code == ffi::HIP_ERROR_OUT_OF_MEMORY {
        return Err(DriverError::OutOfMemory { size });
    }
    check(code, what)?;
    if ptr.is_null() {
        return Err(DriverError::Api(format!("{} returned a null pointer", what)));
    }
    Ok(())
}

/// [`Driver`] backed by the HIP runtime (`rocm` feature).
#[derive(Debug)]
pub struct HipDriver {
    devices: usize,
}

impl HipDriver {
    /// Initialize HIP and enumerate devices.
    pub fn new() -> DriverResult<Self> {
        check(unsafe { ffi::hipInit(0) }, "hipInit")?;
        let mut count: i32 = 0;
        check(
            unsafe { ffi::hipGetDeviceCount(&mut count) },
            "hipGetDeviceCount",
        )?;
        tracing::debug!("HIP initialized with {} device(s)", count);
        Ok(HipDriver {
            devices: count.max(0) as usize,
        })
    }

    fn set_device(&self, device: i32) -> DriverResult<()> {
        check(unsafe { ffi::hipSetDevice(device) }, "hipSetDevice")
    }
}

extern "C" fn host_fn_trampoline(data: *mut c_void) {
    // SAFETY: data is the Box<HostFn> leaked in launch_host_func; the
    // driver invokes the trampoline exactly once.
    let f = unsafe { Box::from_raw(data as *mut HostFn) };
    f();
}

impl Driver for HipDriver {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn host_alloc(&self, size: usize) -> DriverResult<*mut c_void> {
        let layout = std::alloc::Layout::from_size_align(size, crate::cache::BASE_ALIGN)
            .map_err(|e| DriverError::Api(e.to_string()))?;
        // SAFETY: size is a nonzero bucket size, alignment is valid.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(DriverError::OutOfMemory { size });
        }
        Ok(ptr as *mut c_void)
    }

    fn host_free(&self, ptr: *mut c_void, size: usize) {
        // Bucket sizes are stable, so the allocation layout can be
        // reconstructed exactly.
        if let Ok(layout) = std::alloc::Layout::from_size_align(size, crate::cache::BASE_ALIGN) {
            // SAFETY: ptr came out of host_alloc with this layout.
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }

    fn pinned_alloc(&self, size: usize) -> DriverResult<*mut c_void> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let code = unsafe { ffi::hipHostMalloc(&mut ptr, size, 0) };
        check_alloc(code, ptr, size, "hipHostMalloc")?;
        Ok(ptr)
    }

    fn pinned_free(&self, ptr: *mut c_void) {
        let code = unsafe { ffi::hipHostFree(ptr) };
        if code != ffi::HIP_SUCCESS {
            tracing::error!("hipHostFree failed: {}", error_string(code));
        }
    }

    fn device_alloc(&self, device: i32, size: usize) -> DriverResult<*mut c_void> {
        self.set_device(device)?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let code = unsafe { ffi::hipMalloc(&mut ptr, size) };
        check_alloc(code, ptr, size, "hipMalloc")?;
        Ok(ptr)
    }

    fn device_free(&self, ptr: *mut c_void) {
        let code = unsafe { ffi::hipFree(ptr) };
        if code != ffi::HIP_SUCCESS {
            tracing::error!("hipFree failed: {}", error_string(code));
        }
    }

    fn managed_alloc(&self, size: usize, read_mostly: bool) -> DriverResult<*mut c_void> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let code = unsafe { ffi::hipMallocManaged(&mut ptr, size, ffi::HIP_MEM_ATTACH_GLOBAL) };
        check_alloc(code, ptr, size, "hipMallocManaged")?;
        if read_mostly {
            check(
                unsafe {
                    ffi::hipMemAdvise(ptr, size, ffi::HIP_MEM_ADVISE_SET_READ_MOSTLY, 0)
                },
                "hipMemAdvise",
            )?;
        }
        Ok(ptr)
    }

    fn host_register(&self, ptr: *mut c_void, size: usize) -> DriverResult<()> {
        check(
            unsafe { ffi::hipHostRegister(ptr, size, 0) },
            "hipHostRegister",
        )
    }

    fn host_unregister(&self, ptr: *mut c_void) {
        let code = unsafe { ffi::hipHostUnregister(ptr) };
        if code != ffi::HIP_SUCCESS {
            tracing::error!("hipHostUnregister failed: {}", error_string(code));
        }
    }

    fn create_stream(&self, device: i32) -> DriverResult<StreamHandle> {
        self.set_device(device)?;
        let mut stream: *mut c_void = std::ptr::null_mut();
        check(unsafe { ffi::hipStreamCreate(&mut stream) }, "hipStreamCreate")?;
        if stream.is_null() {
            return Err(DriverError::Api(
                "hipStreamCreate returned a null pointer".to_string(),
            ));
        }
        Ok(StreamHandle(stream as usize))
    }

    fn destroy_stream(&self, stream: StreamHandle) {
        let code = unsafe { ffi::hipStreamDestroy(stream.0 as *mut c_void) };
        if code != ffi::HIP_SUCCESS {
            tracing::error!("hipStreamDestroy failed: {}", error_string(code));
        }
    }

    fn memcpy_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        check(
            unsafe {
                ffi::hipMemcpyAsync(
                    dst,
                    src,
                    size,
                    ffi::HIP_MEMCPY_DEFAULT,
                    stream.0 as *mut c_void,
                )
            },
            "hipMemcpyAsync",
        )
    }

    fn launch_host_func(&self, stream: StreamHandle, f: HostFn) -> DriverResult<()> {
        let data = Box::into_raw(Box::new(f)) as *mut c_void;
        let code = unsafe {
            ffi::hipLaunchHostFunc(stream.0 as *mut c_void, host_fn_trampoline, data)
        };
        if code != ffi::HIP_SUCCESS {
            // The driver never took ownership; reclaim the closure.
            // SAFETY: data was produced by Box::into_raw just above.
            drop(unsafe { Box::from_raw(data as *mut HostFn) });
            return Err(DriverError::Api(format!(
                "hipLaunchHostFunc failed: {}",
                error_string(code)
            )));
        }
        Ok(())
    }

    fn prefetch_async(
        &self,
        ptr: *mut c_void,
        size: usize,
        device: i32,
        stream: StreamHandle,
    ) -> DriverResult<()> {
        let device = if device < 0 {
            ffi::HIP_CPU_DEVICE_ID
        } else {
            device
        };
        check(
            unsafe {
                ffi::hipMemPrefetchAsync(ptr, size, device, stream.0 as *mut c_void)
            },
            "hipMemPrefetchAsync",
        )
    }

    fn sync_stream(&self, stream: StreamHandle) -> DriverResult<()> {
        check(
            unsafe { ffi::hipStreamSynchronize(stream.0 as *mut c_void) },
            "hipStreamSynchronize",
        )
    }

    fn sync_device(&self, device: i32) -> DriverResult<()> {
        self.set_device(device)?;
        check(unsafe { ffi::hipDeviceSynchronize() }, "hipDeviceSynchronize")
    }

    fn sync_all(&self) -> DriverResult<()> {
        for device in 0..self.devices {
            self.sync_device(device as i32)?;
        }
        Ok(())
    }
}
