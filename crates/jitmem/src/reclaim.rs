//! Background reclamation workers
//!
//! One host worker per bucket and one device worker per device. Each runs a
//! SLEEP -> SCAN -> (SKIP | RECLAIM) -> SLEEP loop on a plain `std::thread`,
//! sharing a [`WorkerSignal`] so `force_reclaim` can shorten a nap and drop
//! terminates promptly.
//!
//! Host scans drop unreachable points. Device scans additionally evict
//! reachable-but-cold points back to host: a device buffer idle past the
//! configured TTL whose short and long temperatures both fall below the
//! aggressiveness threshold is copied back and its device bytes freed.
//! Per-entry failures are logged and the scan continues; workers never die.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::allocator::AllocatorInner;
use crate::config::Aggressiveness;
use crate::point::{now_millis, MemoryClass};
use crate::stats::ScanStats;

/// Minimum nap between host scans
pub(crate) const HOST_SCAN_FLOOR: Duration = Duration::from_secs(10);
/// Minimum nap between device scans
pub(crate) const DEVICE_SCAN_FLOOR: Duration = Duration::from_secs(5);

/// Object counts that force at least `Urgent` per class
const HOST_OBJECT_CEILING: usize = 500_000;
const DEVICE_OBJECT_CEILING: usize = 100_000;

/// Object counts below which a scan may be skipped entirely
const HOST_SKIP_OBJECTS: usize = 5_000;
const DEVICE_SKIP_OBJECTS: usize = 500;

/// Cap fill ratios steering escalation and skipping
const URGENT_FILL: f64 = 0.75;
const IMMEDIATE_FILL: f64 = 0.85;
const SKIP_FILL: f64 = 0.25;

/// A scan this recent allows the skip rule to apply
const SKIP_RECENT: Duration = Duration::from_secs(30);

/// Long temperature rings advance once per this many scans
const LONG_ROLL_EVERY: u64 = 10;

/// Shared wake/terminate signal for all reclamation workers
pub(crate) struct WorkerSignal {
    terminated: AtomicBool,
    generation: Mutex<u64>,
    wake: Condvar,
}

impl WorkerSignal {
    pub(crate) fn new() -> Self {
        Self {
            terminated: AtomicBool::new(false),
            generation: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    /// Nap for up to `dur`; returns early on `force` or `terminate`
    pub(crate) fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        let mut generation = self.generation.lock();
        let seen = *generation;
        while !self.terminated.load(Ordering::Acquire) && *generation == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.wake.wait_for(&mut generation, deadline - now).timed_out() {
                break;
            }
        }
    }

    /// Wake every sleeping worker for an early scan
    pub(crate) fn force(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.wake.notify_all();
    }

    /// Tell all workers to exit after their current pass
    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.force();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// Spawn host and device workers for an allocator context
pub(crate) fn spawn_workers(
    inner: &Arc<AllocatorInner>,
    signal: &Arc<WorkerSignal>,
) -> Vec<JoinHandle<()>> {
    let host_buckets = inner.config.read().host_buckets;
    let device_count = inner.handler.read().device_count();

    let mut handles = Vec::with_capacity(host_buckets + device_count);
    for bucket in 0..host_buckets {
        let inner = Arc::clone(inner);
        let signal = Arc::clone(signal);
        handles.push(thread::spawn(move || host_worker(inner, signal, bucket)));
    }
    for device_id in 0..device_count {
        let inner = Arc::clone(inner);
        let signal = Arc::clone(signal);
        handles.push(thread::spawn(move || device_worker(inner, signal, device_id)));
    }
    handles
}

fn host_worker(inner: Arc<AllocatorInner>, signal: Arc<WorkerSignal>, bucket: usize) {
    let mut last_scan: Option<Instant> = None;
    let mut scans: u64 = 0;

    while !signal.is_terminated() {
        let nap = inner.config.read().min_ttl.max(HOST_SCAN_FLOOR);
        signal.sleep(nap);
        if signal.is_terminated() {
            break;
        }

        let config = inner.config.read().clone();
        let objects = inner.table.host_bucket_count(bucket, config.host_buckets);
        let bytes = inner.handler.read().host_bytes();
        if should_skip(bytes, config.max_host_bytes, objects, HOST_SKIP_OBJECTS, last_scan) {
            continue;
        }

        let level = escalate(
            config.host_aggressiveness,
            objects,
            HOST_OBJECT_CEILING,
            bytes,
            config.max_host_bytes,
        );
        scans += 1;
        // One worker advances the shared rings; each interval rolls once.
        if bucket == 0 {
            inner.host_short.roll();
            if scans % LONG_ROLL_EVERY == 0 {
                inner.host_long.roll();
            }
        }

        let stats = scan_host_bucket(&inner, bucket, level);
        last_scan = Some(Instant::now());
        debug!(
            bucket,
            level = ?level,
            checked = stats.checked,
            dropped = stats.dropped,
            survived = stats.survived,
            "Host reclamation scan complete"
        );
    }
}

fn device_worker(inner: Arc<AllocatorInner>, signal: Arc<WorkerSignal>, device_id: usize) {
    let mut last_scan: Option<Instant> = None;
    let mut scans: u64 = 0;

    while !signal.is_terminated() {
        let nap = inner.config.read().min_ttl.max(DEVICE_SCAN_FLOOR);
        signal.sleep(nap);
        if signal.is_terminated() {
            break;
        }

        let config = inner.config.read().clone();
        let objects = inner.table.device_count(device_id);
        let bytes = inner.handler.read().device_bytes(device_id);
        if should_skip(bytes, config.max_device_bytes, objects, DEVICE_SKIP_OBJECTS, last_scan) {
            continue;
        }

        let level = escalate(
            config.device_aggressiveness,
            objects,
            DEVICE_OBJECT_CEILING,
            bytes,
            config.max_device_bytes,
        );
        scans += 1;
        let reset_long = scans % LONG_ROLL_EVERY == 0;
        if device_id == 0 {
            inner.device_short.roll();
            if reset_long {
                inner.device_long.roll();
            }
        }

        let stats = scan_device(&inner, device_id, level, reset_long);
        last_scan = Some(Instant::now());
        debug!(
            device = device_id,
            level = ?level,
            checked = stats.checked,
            dropped = stats.dropped,
            evicted = stats.evicted,
            survived = stats.survived,
            "Device reclamation scan complete"
        );
    }
}

/// Whether pressure is low enough to skip a scan outright
fn should_skip(
    bytes: u64,
    cap: u64,
    objects: usize,
    skip_objects: usize,
    last_scan: Option<Instant>,
) -> bool {
    let recent = last_scan.is_some_and(|at| at.elapsed() < SKIP_RECENT);
    let fill = bytes as f64 / cap as f64;
    recent && fill < SKIP_FILL && objects < skip_objects
}

/// Raise the configured aggressiveness under object or byte pressure
fn escalate(
    base: Aggressiveness,
    objects: usize,
    object_ceiling: usize,
    bytes: u64,
    cap: u64,
) -> Aggressiveness {
    let fill = bytes as f64 / cap as f64;
    if fill > IMMEDIATE_FILL {
        return Aggressiveness::Immediate;
    }
    if fill > URGENT_FILL || objects > object_ceiling {
        return base.max(Aggressiveness::Urgent);
    }
    base
}

/// One host reclamation pass over a bucket's points
///
/// Only unreachable points are dropped. Below `Immediate` a busy point is
/// skipped this round; at `Immediate` the scan waits for its Toe so progress
/// is guaranteed under cap pressure.
pub(crate) fn scan_host_bucket(
    inner: &AllocatorInner,
    bucket: usize,
    level: Aggressiveness,
) -> ScanStats {
    let buckets = inner.config.read().host_buckets;
    let handler = Arc::clone(&*inner.handler.read());
    let mut stats = ScanStats::default();

    for point in inner.table.host_bucket_points(bucket, buckets) {
        stats.checked += 1;
        if point.is_reachable() {
            stats.survived += 1;
            continue;
        }

        let toe = if level >= Aggressiveness::Immediate {
            Some(point.access().request_toe())
        } else {
            point.access().try_request_toe()
        };
        let Some(_toe) = toe else {
            stats.survived += 1;
            continue;
        };

        // Removal precedes the free so a racing lookup finds nothing
        // rather than a dying pointer.
        inner.table.remove(point.id());
        match handler.free_all(&point) {
            Ok(_) => {
                inner.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
                stats.dropped += 1;
            }
            Err(err) => {
                warn!(id = %point.id(), error = %err, "Failed to free unreachable host point");
            }
        }
    }
    stats
}

/// One device reclamation pass
///
/// Unreachable points are freed outright. Reachable points idle past the
/// configured TTL whose short and long temperatures both fall below the
/// aggressiveness threshold are relocated back to host, freeing device bytes.
pub(crate) fn scan_device(
    inner: &AllocatorInner,
    device_id: usize,
    level: Aggressiveness,
    reset_long: bool,
) -> ScanStats {
    let config = inner.config.read().clone();
    let handler = Arc::clone(&*inner.handler.read());
    let short_cut = level.threshold(inner.device_short.average());
    let long_cut = level.threshold(inner.device_long.average());
    let min_ttl_ms = config.min_ttl.as_millis() as u64;
    let now = now_millis();
    let mut stats = ScanStats::default();

    for point in inner.table.device_points(device_id) {
        stats.checked += 1;

        if !point.is_reachable() {
            let toe = if level >= Aggressiveness::Immediate {
                Some(point.access().request_toe())
            } else {
                point.access().try_request_toe()
            };
            let Some(_toe) = toe else {
                stats.survived += 1;
                continue;
            };
            inner.table.remove(point.id());
            match handler.free_all(&point) {
                Ok(_) => {
                    inner.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
                    stats.dropped += 1;
                }
                Err(err) => {
                    warn!(id = %point.id(), error = %err, "Failed to free unreachable device point");
                }
            }
            continue;
        }

        let idle = now.saturating_sub(point.last_access_ms());
        let short_temp = point.take_timer_short() as f32;
        let long_temp = if reset_long {
            point.take_timer_long() as f32
        } else {
            point.timer_long() as f32
        };
        if idle < min_ttl_ms || short_temp >= short_cut || long_temp >= long_cut {
            stats.survived += 1;
            continue;
        }

        match handler.relocate(&point, MemoryClass::Host, device_id) {
            Ok(()) => {
                inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                inner.counters.transfers_d2h.fetch_add(1, Ordering::Relaxed);
                stats.evicted += 1;
            }
            Err(err) => {
                warn!(id = %point.id(), error = %err, "Eviction copyback failed; point survives");
                stats.survived += 1;
            }
        }
    }
    stats
}

/// Inline emergency sweep: free every unreachable point immediately
///
/// Called from the allocation path when a class cap is exceeded, before the
/// request is retried. Returns bytes freed.
pub(crate) fn sweep_dead(inner: &AllocatorInner) -> u64 {
    let handler = Arc::clone(&*inner.handler.read());
    let mut freed = 0u64;

    for point in inner.table.all_points() {
        if point.is_reachable() {
            continue;
        }
        let _toe = point.access().request_toe();
        inner.table.remove(point.id());
        match handler.free_all(&point) {
            Ok(bytes) => {
                inner.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
                freed += bytes;
            }
            Err(err) => {
                warn!(id = %point.id(), error = %err, "Failed to free point during emergency sweep");
            }
        }
    }
    freed
}
