//! Integration tests for the jitmem allocator

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jitmem::{
    Allocator, AllocatorConfig, AllocationStatus, MemoryClass, MemoryModel,
};

/// Full host/device round trip: host writes, device compute overwrites,
/// synchronization makes the device result visible to host readers
#[test]
fn test_end_to_end_device_roundtrip() {
    let allocator = Allocator::new(AllocatorConfig::default()).unwrap();
    let handle = allocator.allocate(1024 * 1024, true).unwrap();
    assert_eq!(handle.status(), AllocationStatus::Device);

    // Host-side initialization through the mirror.
    let host_ptr = allocator.resolve_pointer(&handle, MemoryClass::Host).unwrap();
    unsafe { std::slice::from_raw_parts_mut(host_ptr, 3).copy_from_slice(&[1, 2, 3]) };
    allocator.mark_write(&handle, MemoryClass::Host);

    // Device-side compute: the resolve pushes the host writes first.
    let device_ptr = allocator.resolve_pointer(&handle, MemoryClass::Device).unwrap();
    {
        let view = unsafe { std::slice::from_raw_parts_mut(device_ptr, 3) };
        assert_eq!(view, &[1, 2, 3]);
        view.copy_from_slice(&[4, 5, 6]);
    }
    allocator.mark_write(&handle, MemoryClass::Device);

    allocator.synchronize_host_data(&handle).unwrap();
    let host_ptr = allocator.resolve_pointer(&handle, MemoryClass::Host).unwrap();
    let view = unsafe { std::slice::from_raw_parts(host_ptr, 3) };
    assert_eq!(view, &[4, 5, 6]);

    allocator.release(&handle).unwrap();
}

/// An open access session pins the placement: promotion to device waits for
/// the session to end before moving the bytes
#[test]
fn test_access_session_blocks_relocation() {
    let allocator = Arc::new(Allocator::new(AllocatorConfig::default()).unwrap());
    let handle = allocator.allocate_at(4096, AllocationStatus::Host, true).unwrap();

    let session = handle.begin_access();

    let worker_alloc = Arc::clone(&allocator);
    let worker_handle = handle.clone();
    let promoter = thread::spawn(move || {
        worker_alloc.resolve_pointer(&worker_handle, MemoryClass::Device).unwrap();
    });

    // The promoter is stuck draining our tick; residence must not change.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.status(), AllocationStatus::Host);

    drop(session);
    promoter.join().unwrap();
    assert_eq!(handle.status(), AllocationStatus::Device);
}

/// The exclusive Toe window admits at most one holder at a time, no matter
/// how many threads contend for it
#[test]
fn test_single_toe_holder_under_contention() {
    use std::sync::atomic::{AtomicU32, Ordering};

    use jitmem::AccessState;

    let state = Arc::new(AccessState::new());
    let holders = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut contenders = Vec::new();
    for _ in 0..8 {
        let state = Arc::clone(&state);
        let holders = Arc::clone(&holders);
        let peak = Arc::clone(&peak);
        contenders.push(thread::spawn(move || {
            for _ in 0..500 {
                let guard = state.request_toe();
                let concurrent = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(concurrent, Ordering::SeqCst);
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            }
        }));
    }
    for contender in contenders {
        contender.join().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1, "overlapping exclusive windows observed");
}

/// Concurrent readers never observe a torn or partially copied buffer while
/// writes and placement changes churn underneath them
#[test]
fn test_no_torn_reads_under_churn() {
    const LEN: usize = 64 * 1024;
    let allocator = Arc::new(Allocator::new(AllocatorConfig::default()).unwrap());
    let handle = allocator.allocate_at(LEN, AllocationStatus::Host, true).unwrap();

    let mut pattern = vec![0u8; LEN];
    rand::Rng::fill(&mut rand::thread_rng(), &mut pattern[..]);
    allocator.memcpy(&handle, &pattern, 0).unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let allocator = Arc::clone(&allocator);
        let handle = handle.clone();
        let pattern = pattern.clone();
        readers.push(thread::spawn(move || {
            for _ in 0..200 {
                let ptr = allocator.resolve_pointer(&handle, MemoryClass::Host).unwrap();
                let _session = handle.begin_access();
                let view = unsafe { std::slice::from_raw_parts(ptr, LEN) };
                assert_eq!(view, &pattern[..], "reader observed a torn buffer");
            }
        }));
    }

    // Churn: rewrite the same pattern and bounce residence device-ward.
    for _ in 0..50 {
        allocator.memcpy(&handle, &pattern, 0).unwrap();
        allocator.resolve_pointer(&handle, MemoryClass::Device).unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
}

/// Background reclamation drops buffers whose handles are gone and never
/// touches one with a live handle
#[test]
fn test_reclamation_spares_reachable_buffers() {
    let allocator = Allocator::new(AllocatorConfig::default()).unwrap();

    let keep = allocator.allocate(4096, true).unwrap();
    allocator.memcpy(&keep, &[42u8; 16], 0).unwrap();
    for _ in 0..8 {
        let dead = allocator.allocate(4096, true).unwrap();
        drop(dead);
    }
    assert_eq!(allocator.tracked_points(), 9);

    allocator.force_reclaim();
    let deadline = Instant::now() + Duration::from_secs(5);
    while allocator.tracked_points() > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
        allocator.force_reclaim();
    }

    assert_eq!(allocator.tracked_points(), 1);
    assert!(allocator.stats().reclaimed >= 8);

    // The survivor is intact and still readable.
    let ptr = allocator.resolve_pointer(&keep, MemoryClass::Host).unwrap();
    let view = unsafe { std::slice::from_raw_parts(ptr, 16) };
    assert_eq!(view, &[42u8; 16]);
}

/// Release is idempotent across explicit calls and handle clones
#[test]
fn test_release_idempotent_across_clones() {
    let allocator = Allocator::new(AllocatorConfig::default()).unwrap();
    let handle = allocator.allocate(512, true).unwrap();
    let clone = handle.clone();

    allocator.release(&handle).unwrap();
    allocator.release(&clone).unwrap();
    allocator.release(&handle).unwrap();

    assert_eq!(allocator.tracked_points(), 0);
    assert_eq!(allocator.stats().releases, 1);
    assert_eq!(clone.status(), AllocationStatus::Deallocated);
}

/// Under the delayed model buffers start on host and move to device only
/// when device access demands it
#[test]
fn test_delayed_model_promotes_on_device_access() {
    let config = AllocatorConfig { memory_model: MemoryModel::Delayed, ..Default::default() };
    let allocator = Allocator::new(config).unwrap();

    let handle = allocator.allocate_at(256, AllocationStatus::Device, true).unwrap();
    assert_eq!(handle.status(), AllocationStatus::Host);
    assert_eq!(allocator.get_device_id(&handle), None);

    allocator.resolve_pointer(&handle, MemoryClass::Device).unwrap();
    assert_eq!(handle.status(), AllocationStatus::Device);
    assert_eq!(allocator.get_device_id(&handle), Some(0));
    assert_eq!(allocator.stats().transfers_h2d, 1);
}

/// Stats snapshots account for bytes across both classes
#[test]
fn test_stats_track_bytes() {
    let allocator = Allocator::new(AllocatorConfig::default()).unwrap();
    let device = allocator.allocate(1000, true).unwrap();
    let host = allocator.allocate_at(500, AllocationStatus::Host, true).unwrap();

    let stats = allocator.stats();
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.device_bytes, 1000);
    assert_eq!(stats.host_bytes, 500);
    assert_eq!(stats.tracked_points, 2);

    allocator.release(&device).unwrap();
    allocator.release(&host).unwrap();
    let stats = allocator.stats();
    assert_eq!(stats.device_bytes, 0);
    assert_eq!(stats.host_bytes, 0);
}
