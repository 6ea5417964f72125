//! End-to-end allocation cache behavior over the simulated driver:
//! bucketing, recycling, deferred frees, trim and shutdown accounting.

use std::sync::Arc;

use serial_test::serial;
use streamalloc::backend::SimDriver;
use streamalloc::{set_active_stream, AllocCache, AllocError, AllocKind, Driver};

fn cache_with(devices: usize) -> (AllocCache, Arc<SimDriver>) {
    let driver = Arc::new(SimDriver::new(devices));
    (
        AllocCache::new(Arc::clone(&driver) as Arc<dyn Driver>),
        driver,
    )
}

#[test]
#[serial]
fn host_cache_hit_reuses_rounded_bucket() {
    let (cache, driver) = cache_with(1);
    set_active_stream(None);

    // 100 and 120 both round to the 128-byte bucket.
    let p1 = cache.alloc(AllocKind::Host, 100).unwrap();
    cache.free(p1).unwrap();
    let p2 = cache.alloc(AllocKind::Host, 120).unwrap();

    assert_eq!(p2, p1, "second allocation must recycle the freed bucket");
    assert_eq!(driver.alloc_calls(), 1, "only one raw allocation happened");

    let metrics = cache.metrics().unwrap();
    assert_eq!(metrics.kind(AllocKind::Host).live_count, 1);
    assert_eq!(metrics.kind(AllocKind::Host).live_bytes, 128);
    assert_eq!(
        metrics.kind(AllocKind::Host).cached_count,
        0,
        "the bucket is empty again after the hit"
    );
    cache.check_invariants();

    cache.free(p2).unwrap();
    cache.shutdown().unwrap();
    assert_eq!(driver.outstanding_allocs(), 0);
}

#[test]
#[serial]
fn device_free_recycles_locally_without_flush() {
    let (cache, driver) = cache_with(1);
    let stream = cache.create_gpu_stream(0).unwrap();
    set_active_stream(Some(Arc::clone(&stream)));

    let d1 = cache.alloc(AllocKind::Device, 1024).unwrap();
    cache.free(d1).unwrap();

    // No flush, no sync: the pointer is pending on this stream's release
    // chain and must come straight back for a same-stream allocation.
    let d2 = cache.alloc(AllocKind::Device, 1024).unwrap();
    assert_eq!(d2, d1);
    assert_eq!(driver.alloc_calls(), 1);
    cache.check_invariants();

    cache.free(d2).unwrap();
    cache.flush().unwrap();
    stream.sync().unwrap();
    set_active_stream(None);
    cache.shutdown().unwrap();
    assert_eq!(driver.outstanding_allocs(), 0);
}

#[test]
#[serial]
fn cross_stream_isolation_until_flush() {
    let (cache, _driver) = cache_with(1);
    let stream_a = cache.create_gpu_stream(0).unwrap();
    let stream_b = cache.create_gpu_stream(0).unwrap();

    set_active_stream(Some(Arc::clone(&stream_a)));
    let a = cache.alloc(AllocKind::Device, 64).unwrap();
    cache.free(a).unwrap();

    // Stream B must not see A's pending free: it could still be read by
    // in-flight work on A.
    set_active_stream(Some(Arc::clone(&stream_b)));
    let b = cache.alloc(AllocKind::Device, 64).unwrap();
    assert_ne!(b, a);
    cache.check_invariants();

    // Flush A; once its callback has run the pointer is global property.
    set_active_stream(Some(Arc::clone(&stream_a)));
    cache.flush().unwrap();
    stream_a.sync().unwrap();

    set_active_stream(Some(Arc::clone(&stream_b)));
    let b2 = cache.alloc(AllocKind::Device, 64).unwrap();
    assert_eq!(b2, a, "flushed pointer is reusable on any stream");
    cache.check_invariants();

    cache.free(b).unwrap();
    cache.free(b2).unwrap();
    cache.flush().unwrap();
    stream_b.sync().unwrap();
    set_active_stream(None);
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn oom_triggers_one_trim_and_retry() {
    let (cache, driver) = cache_with(1);
    set_active_stream(None);

    // Park one pointer in the global cache so the trim has something to
    // release.
    let p = cache.alloc(AllocKind::Host, 128).unwrap();
    cache.free(p).unwrap();
    assert_eq!(driver.free_calls(), 0);

    driver.fail_next_host_allocs(1);
    let q = cache.alloc(AllocKind::Host, 4096).unwrap();
    assert!(!q.is_null());

    // First attempt refused, trim released the cached 128-byte bucket,
    // retry succeeded.
    assert_eq!(driver.free_calls(), 1);
    let metrics = cache.metrics().unwrap();
    assert_eq!(metrics.kind(AllocKind::Host).cached_count, 0);
    assert_eq!(metrics.kind(AllocKind::Host).live_bytes, 4096);
    cache.check_invariants();

    cache.free(q).unwrap();
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn oom_without_trimmable_memory_surfaces() {
    let (cache, driver) = cache_with(1);
    set_active_stream(None);

    driver.fail_next_host_allocs(2);
    let err = cache.alloc(AllocKind::Host, 4096).unwrap_err();
    assert!(matches!(
        err,
        AllocError::OutOfMemory {
            kind: AllocKind::Host,
            size: 4096
        }
    ));
    assert!(err.is_out_of_memory());
    cache.check_invariants();
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn shutdown_reports_leaks_without_freeing() {
    let (cache, driver) = cache_with(1);
    set_active_stream(None);

    let p = cache.alloc(AllocKind::Host, 1).unwrap();
    assert!(!p.is_null());

    cache.shutdown().unwrap();

    // The leaked pointer stays live (and raw): freeing it could race
    // with async work. Only the report happens.
    let metrics = cache.metrics().unwrap();
    assert_eq!(metrics.kind(AllocKind::Host).live_count, 1);
    assert!(metrics.kind(AllocKind::Host).live_bytes >= 64);
    assert_eq!(driver.outstanding_allocs(), 1);
    cache.check_invariants();

    cache.free(p).unwrap();
    cache.trim().unwrap();
    assert_eq!(driver.outstanding_allocs(), 0);
}

#[test]
#[serial]
fn trim_then_shutdown_on_idle_cache_is_clean() {
    let (cache, driver) = cache_with(1);
    let stream = cache.create_gpu_stream(0).unwrap();
    set_active_stream(Some(Arc::clone(&stream)));

    for size in [64usize, 256, 1024, 4096] {
        let d = cache.alloc(AllocKind::Device, size).unwrap();
        let h = cache.alloc(AllocKind::Host, size).unwrap();
        cache.free(d).unwrap();
        cache.free(h).unwrap();
    }
    cache.flush().unwrap();
    stream.sync().unwrap();

    cache.trim().unwrap();
    let metrics = cache.metrics().unwrap();
    assert!(metrics.is_idle(), "nothing live, nothing cached: {metrics}");

    set_active_stream(None);
    cache.shutdown().unwrap();
    assert_eq!(driver.outstanding_allocs(), 0);
    assert_eq!(driver.registered_count(), 0);
}

#[test]
#[serial]
fn zero_size_allocations_are_null_and_unregistered() {
    let (cache, driver) = cache_with(1);
    set_active_stream(None);

    let p = cache.alloc(AllocKind::Host, 0).unwrap();
    assert!(p.is_null());
    assert_eq!(driver.alloc_calls(), 0);

    // Null frees are no-ops, not errors.
    cache.free(std::ptr::null_mut()).unwrap();
    assert!(cache.metrics().unwrap().is_idle());
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn freeing_an_unknown_pointer_is_a_usage_error() {
    let (cache, _driver) = cache_with(1);
    set_active_stream(None);

    let bogus = 0x4000usize as *mut std::ffi::c_void;
    let err = cache.free(bogus).unwrap_err();
    assert!(matches!(err, AllocError::UnknownPointer { addr: 0x4000 }));
    assert!(err.is_usage_error());
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn device_allocation_requires_a_gpu_stream() {
    let (cache, _driver) = cache_with(1);

    set_active_stream(None);
    let err = cache.alloc(AllocKind::Device, 64).unwrap_err();
    assert!(matches!(err, AllocError::NoActiveStream { .. }));

    #[cfg(feature = "host-async")]
    {
        let host_stream = cache.create_host_stream();
        set_active_stream(Some(host_stream));
        let err = cache.alloc(AllocKind::Device, 64).unwrap_err();
        assert!(matches!(err, AllocError::WrongBackend { .. }));
        set_active_stream(None);
    }
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn pinned_free_takes_the_synchronous_path() {
    let (cache, driver) = cache_with(1);
    let stream = cache.create_gpu_stream(0).unwrap();
    set_active_stream(Some(Arc::clone(&stream)));

    let p = cache.alloc(AllocKind::HostPinned, 64).unwrap();
    cache.free(p).unwrap();

    // Pinned memory is visible to every stream, so the free synchronized
    // and went straight to the global cache: reusable at once, no flush.
    let q = cache.alloc(AllocKind::HostPinned, 64).unwrap();
    assert_eq!(q, p);
    assert_eq!(driver.alloc_calls(), 1);
    cache.check_invariants();

    cache.free(q).unwrap();
    set_active_stream(None);
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn device_free_without_stream_synchronizes_and_goes_global() {
    let (cache, _driver) = cache_with(1);
    let stream = cache.create_gpu_stream(0).unwrap();

    set_active_stream(Some(Arc::clone(&stream)));
    let d = cache.alloc(AllocKind::Device, 512).unwrap();

    // Freeing with no active stream is the misuse backstop: all devices
    // are synchronized and the pointer becomes global immediately.
    set_active_stream(None);
    cache.free(d).unwrap();

    set_active_stream(Some(Arc::clone(&stream)));
    let d2 = cache.alloc(AllocKind::Device, 512).unwrap();
    assert_eq!(d2, d, "globally cached pointer is reusable right away");
    cache.check_invariants();

    cache.free(d2).unwrap();
    cache.flush().unwrap();
    stream.sync().unwrap();
    set_active_stream(None);
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn device_free_on_wrong_device_stream_stays_off_the_chain() {
    let (cache, _driver) = cache_with(2);
    let stream0 = cache.create_gpu_stream(0).unwrap();
    let stream1 = cache.create_gpu_stream(1).unwrap();

    set_active_stream(Some(Arc::clone(&stream0)));
    let d = cache.alloc(AllocKind::Device, 256).unwrap();

    // A device-0 pointer freed under a device-1 stream cannot be parked
    // on that stream's chain; it takes the synchronous path instead.
    set_active_stream(Some(Arc::clone(&stream1)));
    cache.free(d).unwrap();

    set_active_stream(Some(Arc::clone(&stream0)));
    let d2 = cache.alloc(AllocKind::Device, 256).unwrap();
    assert_eq!(d2, d);
    cache.check_invariants();

    cache.free(d2).unwrap();
    cache.flush().unwrap();
    stream0.sync().unwrap();
    set_active_stream(None);
    cache.shutdown().unwrap();
}

#[cfg(feature = "host-async")]
#[test]
#[serial]
fn host_async_recycles_on_its_worker_stream() {
    let (cache, driver) = cache_with(1);
    let stream = cache.create_host_stream();
    set_active_stream(Some(Arc::clone(&stream)));

    let p1 = cache.alloc(AllocKind::HostAsync, 512).unwrap();
    cache.free(p1).unwrap();
    let p2 = cache.alloc(AllocKind::HostAsync, 512).unwrap();
    assert_eq!(p2, p1, "local recycle works on worker-pool streams too");
    assert_eq!(driver.alloc_calls(), 1);

    cache.free(p2).unwrap();
    cache.flush().unwrap();
    stream.sync().unwrap();

    // After the flush callback the pointer serves any worker stream.
    let other = cache.create_host_stream();
    set_active_stream(Some(Arc::clone(&other)));
    let p3 = cache.alloc(AllocKind::HostAsync, 512).unwrap();
    assert_eq!(p3, p1);
    cache.check_invariants();

    cache.free(p3).unwrap();
    cache.flush().unwrap();
    other.sync().unwrap();
    set_active_stream(None);
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn usage_and_watermark_track_the_live_set() {
    let (cache, _driver) = cache_with(1);
    set_active_stream(None);

    assert_eq!(cache.usage(AllocKind::Host).unwrap(), 0);

    let a = cache.alloc(AllocKind::Host, 100).unwrap(); // 128
    let b = cache.alloc(AllocKind::Host, 1000).unwrap(); // 1024
    assert_eq!(cache.usage(AllocKind::Host).unwrap(), 1152);
    assert_eq!(cache.watermark(AllocKind::Host).unwrap(), 1152);

    cache.free(a).unwrap();
    assert_eq!(cache.usage(AllocKind::Host).unwrap(), 1024);
    assert_eq!(
        cache.watermark(AllocKind::Host).unwrap(),
        1152,
        "watermark is monotone"
    );

    // A cache hit counts as live bytes again.
    let c = cache.alloc(AllocKind::Host, 128).unwrap();
    assert_eq!(c, a);
    assert_eq!(cache.usage(AllocKind::Host).unwrap(), 1152);
    cache.check_invariants();

    cache.free(b).unwrap();
    cache.free(c).unwrap();
    cache.shutdown().unwrap();
}

#[test]
#[serial]
fn randomized_churn_preserves_invariants() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let (cache, driver) = cache_with(1);
    let stream = cache.create_gpu_stream(0).unwrap();
    set_active_stream(Some(Arc::clone(&stream)));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let kinds = [AllocKind::Host, AllocKind::Device, AllocKind::HostPinned];
    let mut live: Vec<*mut std::ffi::c_void> = Vec::new();

    for step in 0..400 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let kind = kinds[rng.gen_range(0..kinds.len())];
            let size = rng.gen_range(1..=8192);
            live.push(cache.alloc(kind, size).unwrap());
        } else {
            let idx = rng.gen_range(0..live.len());
            cache.free(live.swap_remove(idx)).unwrap();
        }
        if step % 50 == 0 {
            cache.check_invariants();
        }
        if step % 97 == 0 {
            cache.flush().unwrap();
        }
    }

    for ptr in live.drain(..) {
        cache.free(ptr).unwrap();
    }
    cache.flush().unwrap();
    stream.sync().unwrap();
    cache.check_invariants();

    cache.trim().unwrap();
    assert!(cache.metrics().unwrap().is_idle());
    set_active_stream(None);
    cache.shutdown().unwrap();
    assert_eq!(driver.outstanding_allocs(), 0);
}
