//! The allocator façade
//!
//! [`Allocator`] is an explicit context object: construct one per process (or
//! per test) and pass it around. There is no global instance. Construction
//! validates the configuration, builds the default [`TransportHandler`] over
//! a [`MirrorTransport`], and spawns the reclamation workers; `Drop`
//! terminates and joins them.
//!
//! Buffers are owned through [`BufferHandle`]. Dropping the last clone of a
//! handle makes the point unreachable and the background workers reclaim it;
//! an explicit [`Allocator::release`] frees immediately. Both paths are
//! idempotent with each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use jitmem_transport::{MemoryTransport, MirrorTransport, TransferEvent};

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::handler::{MemoryHandler, TransportHandler};
use crate::point::{
    AccessSession, AllocationPoint, AllocationStatus, BufferId, MemoryClass, OwnerToken,
};
use crate::policy::PlacementPolicy;
use crate::reclaim::{self, WorkerSignal};
use crate::ring::{AccessRing, DEFAULT_RING_CAPACITY};
use crate::stats::{AllocatorStats, StatCounters};
use crate::table::TrackingTable;

/// Shared state behind the façade, visible to the reclamation workers
pub(crate) struct AllocatorInner {
    pub(crate) config: RwLock<AllocatorConfig>,
    pub(crate) handler: RwLock<Arc<dyn MemoryHandler>>,
    pub(crate) table: TrackingTable,
    pub(crate) host_short: AccessRing,
    pub(crate) host_long: AccessRing,
    pub(crate) device_short: AccessRing,
    pub(crate) device_long: AccessRing,
    /// Set on first allocation; seals the configuration
    pub(crate) sealed: AtomicBool,
    pub(crate) counters: StatCounters,
}

impl AllocatorInner {
    pub(crate) fn new(config: AllocatorConfig, handler: Arc<dyn MemoryHandler>) -> Self {
        Self {
            config: RwLock::new(config),
            handler: RwLock::new(handler),
            table: TrackingTable::new(),
            host_short: AccessRing::new(DEFAULT_RING_CAPACITY),
            host_long: AccessRing::new(DEFAULT_RING_CAPACITY),
            device_short: AccessRing::new(DEFAULT_RING_CAPACITY),
            device_long: AccessRing::new(DEFAULT_RING_CAPACITY),
            sealed: AtomicBool::new(false),
            counters: StatCounters::default(),
        }
    }

    fn record_rings(&self, class: MemoryClass) {
        match class {
            MemoryClass::Host => {
                self.host_short.record();
                self.host_long.record();
            }
            MemoryClass::Device => {
                self.device_short.record();
                self.device_long.record();
            }
        }
    }
}

/// Owning handle to a tracked buffer
///
/// Cloneable; the point stays reachable while any clone is alive. Access
/// sessions ([`BufferHandle::begin_access`]) pin the placement against
/// relocation for their duration.
#[derive(Clone)]
pub struct BufferHandle {
    point: Arc<AllocationPoint>,
    token: Arc<OwnerToken>,
}

impl BufferHandle {
    /// Buffer identity
    pub fn id(&self) -> BufferId {
        self.token.id()
    }

    /// Tracked size in bytes
    pub fn size_bytes(&self) -> usize {
        self.point.size_bytes()
    }

    /// Current allocation status
    pub fn status(&self) -> AllocationStatus {
        self.point.status()
    }

    /// Begin a compute session (Tick); ends on drop (Tack)
    ///
    /// While any session is open the buffer cannot be relocated or freed.
    pub fn begin_access(&self) -> AccessSession {
        AccessSession::begin(Arc::clone(&self.point))
    }

    pub(crate) fn point(&self) -> &Arc<AllocationPoint> {
        &self.point
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id())
            .field("size_bytes", &self.size_bytes())
            .field("status", &self.status())
            .finish()
    }
}

/// Just-in-time host/device memory allocator
pub struct Allocator {
    inner: Arc<AllocatorInner>,
    signal: Arc<WorkerSignal>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Allocator {
    /// Create an allocator with the default mirror transport
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(MirrorTransport::default()))
    }

    /// Create an allocator over a specific transport
    pub fn with_transport(
        config: AllocatorConfig,
        transport: Arc<dyn MemoryTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let handler: Arc<dyn MemoryHandler> =
            Arc::new(TransportHandler::new(transport, config.initial_device));
        let inner = Arc::new(AllocatorInner::new(config, handler));
        let signal = Arc::new(WorkerSignal::new());
        let workers = reclaim::spawn_workers(&inner, &signal);
        debug!(workers = workers.len(), "Allocator context started");
        Ok(Self { inner, signal, workers: Mutex::new(workers) })
    }

    /// Allocate a buffer at the handler's preferred initial location
    pub fn allocate(&self, size: usize, initialize: bool) -> Result<BufferHandle> {
        let location = self.inner.handler.read().initial_location();
        self.allocate_at(size, location, initialize)
    }

    /// Allocate a buffer at an explicit location
    ///
    /// The memory model still applies: under `Delayed` the buffer lands on
    /// host regardless of the requested location. Non-allocatable targets
    /// fail fast.
    pub fn allocate_at(
        &self,
        size: usize,
        location: AllocationStatus,
        initialize: bool,
    ) -> Result<BufferHandle> {
        let config = self.inner.config.read().clone();
        let status = PlacementPolicy::initial_placement(config.memory_model, location)?;

        let class = match status {
            AllocationStatus::Device => MemoryClass::Device,
            _ => MemoryClass::Host,
        };
        self.ensure_capacity(size, class, &config)?;

        let id = BufferId::generate();
        let token = Arc::new(OwnerToken::new(id));
        let point = Arc::new(AllocationPoint::new(id, size, Arc::downgrade(&token)));

        let handler = Arc::clone(&*self.inner.handler.read());
        handler.populate(&point, status, config.initial_device, initialize)?;
        self.inner.table.put(Arc::clone(&point));
        // Only a completed allocation seals the configuration; a rejected
        // placement or cap failure leaves it still replaceable.
        self.inner.sealed.store(true, Ordering::Release);
        self.inner.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.inner.record_rings(class);
        trace!(id = %id, bytes = size, status = ?status, "Allocated buffer");

        Ok(BufferHandle { point, token })
    }

    /// Resolve the buffer's base pointer for a memory class
    ///
    /// Resolving `Host` on a device-resident buffer synchronizes the host
    /// mirror first; resolving `Device` on a host-resident buffer relocates
    /// it to the current device. The hit path only touches atomics.
    pub fn resolve_pointer(&self, handle: &BufferHandle, class: MemoryClass) -> Result<*mut u8> {
        let point = handle.point();
        if point.status() == AllocationStatus::Deallocated {
            return Err(Error::BufferReleased(point.id()));
        }
        let handler = Arc::clone(&*self.inner.handler.read());

        match class {
            MemoryClass::Host => {
                if point.host_ptr().is_none() || point.written_side() == MemoryClass::Device {
                    if handler.synchronize_host_data(point)? {
                        self.inner.counters.transfers_d2h.fetch_add(1, Ordering::Relaxed);
                    }
                }
                point.record_access();
                self.inner.record_rings(MemoryClass::Host);
                point.host_ptr().ok_or(Error::BufferReleased(point.id()))
            }
            MemoryClass::Device => {
                if point.status() != AllocationStatus::Device
                    && PlacementPolicy::should_promote(point)
                {
                    let config = self.inner.config.read().clone();
                    self.ensure_capacity(point.size_bytes(), MemoryClass::Device, &config)?;
                    handler.relocate(point, MemoryClass::Device, config.initial_device)?;
                    self.inner.counters.transfers_h2d.fetch_add(1, Ordering::Relaxed);
                } else if handler.synchronize_device_data(point)? {
                    self.inner.counters.transfers_h2d.fetch_add(1, Ordering::Relaxed);
                }
                point.record_access();
                self.inner.record_rings(MemoryClass::Device);
                point.device_ptr().ok_or(Error::BufferReleased(point.id()))
            }
        }
    }

    /// Record a read access without resolving a pointer
    pub fn mark_read(&self, handle: &BufferHandle) {
        let point = handle.point();
        point.record_access();
        let class = match point.status() {
            AllocationStatus::Device => MemoryClass::Device,
            _ => MemoryClass::Host,
        };
        self.inner.record_rings(class);
    }

    /// Mark one side as written, making it authoritative
    ///
    /// Device-side compute must call this with [`MemoryClass::Device`] after
    /// writing through a resolved device pointer, or a later host
    /// synchronization will not see the writes.
    pub fn mark_write(&self, handle: &BufferHandle, class: MemoryClass) {
        let handler = Arc::clone(&*self.inner.handler.read());
        match class {
            MemoryClass::Host => handler.tick_host_write(handle.point()),
            MemoryClass::Device => handler.tick_device_write(handle.point()),
        }
        self.inner.record_rings(class);
    }

    /// Flush device-side writes back to the host mirror
    pub fn synchronize_host_data(&self, handle: &BufferHandle) -> Result<()> {
        let handler = Arc::clone(&*self.inner.handler.read());
        if handler.synchronize_host_data(handle.point())? {
            self.inner.counters.transfers_d2h.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Blocking copy of raw bytes into a buffer's current residence
    pub fn memcpy(&self, handle: &BufferHandle, src: &[u8], dst_offset: usize) -> Result<()> {
        let handler = Arc::clone(&*self.inner.handler.read());
        if handle.status() == AllocationStatus::Device {
            self.inner.counters.transfers_h2d.fetch_add(1, Ordering::Relaxed);
        }
        handler.memcpy_blocking(handle.point(), src, dst_offset)
    }

    /// Asynchronous copy; completion is signalled through the event
    pub fn memcpy_async(
        &self,
        handle: &BufferHandle,
        src: &[u8],
        dst_offset: usize,
    ) -> Result<TransferEvent> {
        let handler = Arc::clone(&*self.inner.handler.read());
        if handle.status() == AllocationStatus::Device {
            self.inner.counters.transfers_h2d.fetch_add(1, Ordering::Relaxed);
        }
        handler.memcpy_async(handle.point(), src, dst_offset)
    }

    /// Copy ordered after a prior transfer event
    pub fn memcpy_special(
        &self,
        handle: &BufferHandle,
        src: &[u8],
        dst_offset: usize,
        after: Option<&TransferEvent>,
    ) -> Result<()> {
        let handler = Arc::clone(&*self.inner.handler.read());
        handler.memcpy_special(handle.point(), src, dst_offset, after)
    }

    /// Device-to-device copy between two device-resident buffers
    pub fn memcpy_device(
        &self,
        dst: &BufferHandle,
        src: &BufferHandle,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        let handler = Arc::clone(&*self.inner.handler.read());
        handler.memcpy_device(dst.point(), src.point(), src_offset, dst_offset, len)
    }

    /// Release a buffer immediately
    ///
    /// Idempotent: releasing twice, or releasing after the background
    /// workers already reclaimed the point, is a no-op.
    pub fn release(&self, handle: &BufferHandle) -> Result<()> {
        let point = handle.point();
        if self.inner.table.remove(point.id()).is_none() {
            return Ok(());
        }
        let _toe = point.access().request_toe();
        let handler = Arc::clone(&*self.inner.handler.read());
        handler.free_all(point)?;
        self.inner.counters.releases.fetch_add(1, Ordering::Relaxed);
        trace!(id = %point.id(), "Released buffer");
        Ok(())
    }

    /// Replace the configuration; rejected once any allocation occurred
    pub fn apply_configuration(&self, config: AllocatorConfig) -> Result<()> {
        if self.inner.sealed.load(Ordering::Acquire) {
            return Err(Error::ConfigurationSealed);
        }
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Swap the transfer engine
    ///
    /// Takes the global write lock; must not race in-flight transfers.
    pub fn set_memory_handler(&self, handler: Arc<dyn MemoryHandler>) {
        *self.inner.handler.write() = handler;
    }

    /// Look up a tracked buffer's status by identity
    pub fn buffer_status(&self, id: BufferId) -> Result<AllocationStatus> {
        self.inner
            .table
            .get(id)
            .map(|point| point.status())
            .ok_or(Error::UnknownBuffer(id))
    }

    /// Device a buffer is resident on, if device-resident
    pub fn get_device_id(&self, handle: &BufferHandle) -> Option<usize> {
        handle.point().device_id()
    }

    /// Device used for placements that do not name one
    pub fn device_id(&self) -> usize {
        self.inner.handler.read().current_device()
    }

    /// Snapshot of the current configuration
    pub fn configuration(&self) -> AllocatorConfig {
        self.inner.config.read().clone()
    }

    /// Wake the reclamation workers early
    ///
    /// Does not interrupt a scan already in progress.
    pub fn force_reclaim(&self) {
        self.signal.force();
    }

    /// Number of points currently tracked
    pub fn tracked_points(&self) -> usize {
        self.inner.table.len()
    }

    /// Snapshot of cumulative allocator metrics
    pub fn stats(&self) -> AllocatorStats {
        let handler = Arc::clone(&*self.inner.handler.read());
        let device_bytes: u64 =
            (0..handler.device_count()).map(|d| handler.device_bytes(d)).sum();
        self.inner.counters.snapshot(
            handler.host_bytes(),
            device_bytes,
            self.inner.table.len(),
        )
    }

    /// Check a class cap; on pressure, sweep dead entries once and retry
    fn ensure_capacity(
        &self,
        requested: usize,
        class: MemoryClass,
        config: &AllocatorConfig,
    ) -> Result<()> {
        let handler = Arc::clone(&*self.inner.handler.read());
        let (used, cap) = match class {
            MemoryClass::Host => (handler.host_bytes(), config.max_host_bytes),
            MemoryClass::Device => {
                (handler.device_bytes(config.initial_device), config.max_device_bytes)
            }
        };
        if used + requested as u64 <= cap {
            return Ok(());
        }

        self.inner.counters.forced_sweeps.fetch_add(1, Ordering::Relaxed);
        let freed = reclaim::sweep_dead(&self.inner);
        debug!(class = %class, freed, "Cap pressure forced an inline sweep");

        let used = match class {
            MemoryClass::Host => handler.host_bytes(),
            MemoryClass::Device => handler.device_bytes(config.initial_device),
        };
        if used + requested as u64 <= cap {
            Ok(())
        } else {
            Err(Error::resource_exhausted(requested, cap, class))
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.signal.terminate();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("tracked_points", &self.inner.table.len())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryModel;

    fn allocator() -> Allocator {
        Allocator::new(AllocatorConfig::default()).unwrap()
    }

    #[test]
    fn test_allocate_places_on_device_by_default() {
        let alloc = allocator();
        let handle = alloc.allocate(1024, true).unwrap();
        assert_eq!(handle.status(), AllocationStatus::Device);
        assert_eq!(alloc.get_device_id(&handle), Some(0));
        assert_eq!(alloc.tracked_points(), 1);
    }

    #[test]
    fn test_delayed_model_lands_on_host() {
        let config =
            AllocatorConfig { memory_model: MemoryModel::Delayed, ..Default::default() };
        let alloc = Allocator::new(config).unwrap();
        let handle =
            alloc.allocate_at(256, AllocationStatus::Device, true).unwrap();
        assert_eq!(handle.status(), AllocationStatus::Host);
    }

    #[test]
    fn test_allocate_rejects_non_allocatable_target() {
        let alloc = allocator();
        let result = alloc.allocate_at(256, AllocationStatus::Constant, true);
        assert!(matches!(result, Err(Error::UnsupportedPlacement { .. })));
    }

    #[test]
    fn test_resolve_host_pointer_on_device_buffer() {
        let alloc = allocator();
        let handle = alloc.allocate(16, true).unwrap();
        alloc.memcpy(&handle, &[7u8; 16], 0).unwrap();

        let ptr = alloc.resolve_pointer(&handle, MemoryClass::Host).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 16) };
        assert_eq!(bytes, &[7u8; 16]);
        // The buffer stays device-resident; only the mirror was refreshed.
        assert_eq!(handle.status(), AllocationStatus::Device);
    }

    #[test]
    fn test_resolve_device_pointer_promotes_host_buffer() {
        let alloc = allocator();
        let handle = alloc.allocate_at(64, AllocationStatus::Host, true).unwrap();
        assert_eq!(handle.status(), AllocationStatus::Host);

        let ptr = alloc.resolve_pointer(&handle, MemoryClass::Device).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(handle.status(), AllocationStatus::Device);
        assert_eq!(alloc.stats().transfers_h2d, 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = allocator();
        let handle = alloc.allocate(128, true).unwrap();
        assert_eq!(alloc.buffer_status(handle.id()).unwrap(), AllocationStatus::Device);

        alloc.release(&handle).unwrap();
        alloc.release(&handle).unwrap();
        assert!(matches!(alloc.buffer_status(handle.id()), Err(Error::UnknownBuffer(_))));

        assert_eq!(handle.status(), AllocationStatus::Deallocated);
        assert_eq!(alloc.tracked_points(), 0);
        assert_eq!(alloc.stats().releases, 1);

        // Resolution after release fails cleanly.
        let result = alloc.resolve_pointer(&handle, MemoryClass::Host);
        assert!(matches!(result, Err(Error::BufferReleased(_))));
    }

    #[test]
    fn test_configuration_seals_on_first_allocation() {
        let alloc = allocator();
        let mut config = AllocatorConfig::default();
        config.max_host_bytes = 1024;
        alloc.apply_configuration(config.clone()).unwrap();

        let _handle = alloc.allocate_at(64, AllocationStatus::Host, true).unwrap();
        let result = alloc.apply_configuration(config);
        assert!(matches!(result, Err(Error::ConfigurationSealed)));
    }

    #[test]
    fn test_failed_allocation_does_not_seal_configuration() {
        let alloc = allocator();

        // Rejected placement: no allocation occurred.
        assert!(alloc.allocate_at(64, AllocationStatus::Constant, true).is_err());
        alloc.apply_configuration(AllocatorConfig::default()).unwrap();

        // Cap failure: still no allocation occurred.
        let tight = AllocatorConfig { max_device_bytes: 16, ..Default::default() };
        alloc.apply_configuration(tight).unwrap();
        assert!(alloc.allocate(64, true).is_err());
        alloc.apply_configuration(AllocatorConfig::default()).unwrap();
    }

    #[test]
    fn test_cap_exhaustion_sweeps_then_errors() {
        let config = AllocatorConfig {
            max_host_bytes: 1024,
            memory_model: MemoryModel::Delayed,
            ..Default::default()
        };
        let alloc = Allocator::new(config).unwrap();

        let first = alloc.allocate(1024, true).unwrap();
        let over = alloc.allocate(1024, true);
        assert!(matches!(over, Err(Error::ResourceExhausted { .. })));
        assert_eq!(alloc.stats().forced_sweeps, 1);

        // Dropping the only handle makes the bytes sweepable; the retry
        // inside the next allocation reclaims them inline.
        drop(first);
        let second = alloc.allocate(1024, true).unwrap();
        assert_eq!(second.size_bytes(), 1024);
        assert_eq!(alloc.tracked_points(), 1);
    }

    #[test]
    fn test_handle_clones_share_ownership() {
        let alloc = allocator();
        let handle = alloc.allocate(64, true).unwrap();
        let clone = handle.clone();
        drop(handle);

        // Still reachable through the clone.
        assert!(clone.point().is_reachable());
        assert_eq!(alloc.tracked_points(), 1);
    }

    #[test]
    fn test_memcpy_device_between_buffers() {
        let alloc = allocator();
        let src = alloc.allocate(4, true).unwrap();
        let dst = alloc.allocate(4, true).unwrap();
        alloc.memcpy(&src, &[9, 9, 9, 9], 0).unwrap();

        alloc.memcpy_device(&dst, &src, 0, 0, 4).unwrap();
        let ptr = alloc.resolve_pointer(&dst, MemoryClass::Host).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 4) };
        assert_eq!(bytes, &[9, 9, 9, 9]);
    }

    #[test]
    fn test_drop_joins_workers() {
        let alloc = allocator();
        let _handle = alloc.allocate(64, true).unwrap();
        drop(alloc); // must not hang
    }
}
