//! Allocation points and the Tick/Tack/Toe access protocol
//!
//! An [`AllocationPoint`] is the per-buffer tracking record: where the bytes
//! currently live, which side host/device was written last, how recently and
//! how often the buffer is touched, and whether the owning handle is still
//! reachable. Points are shared between compute threads and reclamation
//! workers via `Arc`; all hot-path fields are atomics, and placement fields
//! are only mutated while holding the point's Toe.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use jitmem_transport::{DeviceRegion, HostRegion};

/// Unique buffer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(u64);

impl BufferId {
    /// Generate a new process-unique buffer ID
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create from raw value
    pub fn from_raw(val: u64) -> Self {
        Self(val)
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer-{:016x}", self.0)
    }
}

/// Memory class a pointer can be resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryClass {
    /// Host (CPU-pinned) memory
    Host,
    /// Device memory
    Device,
}

impl std::fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryClass::Host => write!(f, "host"),
            MemoryClass::Device => write!(f, "device"),
        }
    }
}

/// Current allocation status of a tracked buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationStatus {
    /// Resident in host memory
    Host,
    /// Resident in device memory
    Device,
    /// Placement deferred; not an allocatable target
    Delayed,
    /// Constant memory; not an allocatable target
    Constant,
    /// Memory released; must not appear in the tracking table
    Deallocated,
    /// No placement decided yet
    Undefined,
}

impl AllocationStatus {
    /// Whether this status is a valid target for allocation
    pub fn is_allocatable(self) -> bool {
        matches!(self, AllocationStatus::Host | AllocationStatus::Device)
    }
}

/// Three-state non-blocking access signal: Tick / Tack / Toe
///
/// - `tick` begins a compute session; many may run concurrently and no lock
///   is taken
/// - `tack` ends a session
/// - `toe` is a short exclusive window for synchronization, relocation, or
///   deallocation; while held, no new tick may begin, and the holder waits
///   for outstanding ticks to drain
///
/// A thread must not request a Toe while holding a tick on the same point.
pub struct AccessState {
    ticks: AtomicU32,
    toe: AtomicBool,
}

impl AccessState {
    /// Create a state with no activity
    pub fn new() -> Self {
        Self { ticks: AtomicU32::new(0), toe: AtomicBool::new(false) }
    }

    /// Begin a compute session
    ///
    /// Spins only while a Toe is held; the wait is bounded by the Toe
    /// holder's operation, not unbounded.
    pub fn tick(&self) {
        loop {
            while self.toe.load(Ordering::Acquire) {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
            self.ticks.fetch_add(1, Ordering::AcqRel);
            // Recheck: a Toe may have been granted between the load and the
            // increment. Back out so the holder's drain wait stays honest.
            if !self.toe.load(Ordering::Acquire) {
                return;
            }
            self.ticks.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// End a compute session
    pub fn tack(&self) {
        let prev = self.ticks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "tack without matching tick");
    }

    /// Acquire the exclusive Toe, waiting for outstanding ticks to drain
    pub fn request_toe(&self) -> ToeGuard<'_> {
        while self
            .toe
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        while self.ticks.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        ToeGuard { state: self }
    }

    /// Try to acquire the Toe without blocking
    ///
    /// Fails if another Toe is held or compute sessions are in flight.
    /// Used by reclamation scans to skip busy points rather than stall.
    pub fn try_request_toe(&self) -> Option<ToeGuard<'_>> {
        if self
            .toe
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        if self.ticks.load(Ordering::Acquire) != 0 {
            self.toe.store(false, Ordering::Release);
            return None;
        }
        Some(ToeGuard { state: self })
    }

    /// Number of compute sessions currently in flight
    pub fn active_ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Whether a Toe is currently held
    pub fn is_toe_held(&self) -> bool {
        self.toe.load(Ordering::Acquire)
    }
}

impl Default for AccessState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessState")
            .field("active_ticks", &self.active_ticks())
            .field("toe_held", &self.is_toe_held())
            .finish()
    }
}

/// RAII guard for a held Toe; released on drop, including failure paths
pub struct ToeGuard<'a> {
    state: &'a AccessState,
}

impl Drop for ToeGuard<'_> {
    fn drop(&mut self) {
        self.state.toe.store(false, Ordering::Release);
    }
}

/// RAII compute session: tick on creation, tack on drop
pub struct AccessSession {
    point: Arc<AllocationPoint>,
}

impl AccessSession {
    /// Begin a session against a point
    pub fn begin(point: Arc<AllocationPoint>) -> Self {
        point.access().tick();
        point.record_access();
        Self { point }
    }

    /// The point this session holds open
    pub fn point(&self) -> &Arc<AllocationPoint> {
        &self.point
    }
}

impl Drop for AccessSession {
    fn drop(&mut self) {
        self.point.access().tack();
    }
}

/// Ownership token held by [`BufferHandle`](crate::BufferHandle)
///
/// The allocation point keeps only a `Weak` to this token and inspects its
/// strong count; it never upgrades it, so the allocator can never extend the
/// owning buffer's lifetime.
#[derive(Debug)]
pub struct OwnerToken {
    id: BufferId,
}

impl OwnerToken {
    /// Create a token for a buffer
    pub fn new(id: BufferId) -> Self {
        Self { id }
    }

    /// The buffer this token owns
    pub fn id(&self) -> BufferId {
        self.id
    }
}

/// Placement fields, mutated only while holding the point's Toe
pub(crate) struct PointState {
    pub(crate) status: AllocationStatus,
    pub(crate) device_id: Option<usize>,
    pub(crate) host: Option<HostRegion>,
    pub(crate) device: Option<DeviceRegion>,
}

const SIDE_HOST: u8 = 0;
const SIDE_DEVICE: u8 = 1;

/// Per-buffer tracking record
pub struct AllocationPoint {
    id: BufferId,
    size_bytes: usize,
    state: RwLock<PointState>,
    access: AccessState,
    owner: Weak<OwnerToken>,
    /// Side written most recently; decides which side is authoritative on
    /// the next synchronization
    written_side: AtomicSide,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    timer_short: AtomicU32,
    timer_long: AtomicU32,
}

/// Newtype over `AtomicU32` storing a `MemoryClass` discriminant
struct AtomicSide(AtomicU32);

impl AtomicSide {
    fn new(side: MemoryClass) -> Self {
        Self(AtomicU32::new(match side {
            MemoryClass::Host => u32::from(SIDE_HOST),
            MemoryClass::Device => u32::from(SIDE_DEVICE),
        }))
    }

    fn store(&self, side: MemoryClass) {
        let raw = match side {
            MemoryClass::Host => u32::from(SIDE_HOST),
            MemoryClass::Device => u32::from(SIDE_DEVICE),
        };
        self.0.store(raw, Ordering::Release);
    }

    fn load(&self) -> MemoryClass {
        if self.0.load(Ordering::Acquire) == u32::from(SIDE_DEVICE) {
            MemoryClass::Device
        } else {
            MemoryClass::Host
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl AllocationPoint {
    /// Create an untracked point with no placement yet
    pub fn new(id: BufferId, size_bytes: usize, owner: Weak<OwnerToken>) -> Self {
        Self {
            id,
            size_bytes,
            state: RwLock::new(PointState {
                status: AllocationStatus::Undefined,
                device_id: None,
                host: None,
                device: None,
            }),
            access: AccessState::new(),
            owner,
            written_side: AtomicSide::new(MemoryClass::Host),
            last_read_ms: AtomicU64::new(now_millis()),
            last_write_ms: AtomicU64::new(now_millis()),
            timer_short: AtomicU32::new(0),
            timer_long: AtomicU32::new(0),
        }
    }

    /// Buffer identity
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Tracked size in bytes
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Current allocation status
    pub fn status(&self) -> AllocationStatus {
        self.state.read().status
    }

    /// Device the buffer is resident on, if device-resident
    pub fn device_id(&self) -> Option<usize> {
        self.state.read().device_id
    }

    /// Host-side base pointer for the current placement
    pub fn host_ptr(&self) -> Option<*mut u8> {
        self.state.read().host.as_ref().map(HostRegion::ptr)
    }

    /// Device-side base pointer for the current placement
    pub fn device_ptr(&self) -> Option<*mut u8> {
        self.state.read().device.as_ref().map(DeviceRegion::ptr)
    }

    /// Whether the owning handle is still reachable
    ///
    /// The weak back-reference is counted, never upgraded.
    pub fn is_reachable(&self) -> bool {
        self.owner.strong_count() > 0
    }

    /// The point's access signal
    pub fn access(&self) -> &AccessState {
        &self.access
    }

    /// Side written most recently (authoritative for synchronization)
    pub fn written_side(&self) -> MemoryClass {
        self.written_side.load()
    }

    /// Mark a side as most recently written and bump write timestamps
    pub fn mark_written(&self, side: MemoryClass) {
        self.written_side.store(side);
        self.last_write_ms.store(now_millis(), Ordering::Release);
        self.bump_timers();
    }

    /// Flip the authoritative side without counting it as an access
    ///
    /// Used after relocations and synchronizations, where both sides hold
    /// the same bytes and the move itself should not heat the buffer up.
    pub(crate) fn set_written_side(&self, side: MemoryClass) {
        self.written_side.store(side);
    }

    /// Record a read access: timestamps and temperature timers
    pub fn record_access(&self) {
        self.last_read_ms.store(now_millis(), Ordering::Release);
        self.bump_timers();
    }

    fn bump_timers(&self) {
        self.timer_short.fetch_add(1, Ordering::Relaxed);
        self.timer_long.fetch_add(1, Ordering::Relaxed);
    }

    /// Milliseconds-since-epoch of the last read
    pub fn last_read_ms(&self) -> u64 {
        self.last_read_ms.load(Ordering::Acquire)
    }

    /// Milliseconds-since-epoch of the last write
    pub fn last_write_ms(&self) -> u64 {
        self.last_write_ms.load(Ordering::Acquire)
    }

    /// Most recent of read/write timestamps
    pub fn last_access_ms(&self) -> u64 {
        self.last_read_ms().max(self.last_write_ms())
    }

    /// Event count since the last short-interval harvest, resetting it
    pub(crate) fn take_timer_short(&self) -> u32 {
        self.timer_short.swap(0, Ordering::Relaxed)
    }

    /// Event count since the last long-interval harvest, resetting it
    pub(crate) fn take_timer_long(&self) -> u32 {
        self.timer_long.swap(0, Ordering::Relaxed)
    }

    /// Long-interval event count without resetting
    pub(crate) fn timer_long(&self) -> u32 {
        self.timer_long.load(Ordering::Relaxed)
    }

    /// Placement state, for the handler and reclamation
    pub(crate) fn state(&self) -> &RwLock<PointState> {
        &self.state
    }
}

impl std::fmt::Debug for AllocationPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("AllocationPoint")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("device_id", &state.device_id)
            .field("size_bytes", &self.size_bytes)
            .field("reachable", &self.is_reachable())
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn test_point() -> (Arc<AllocationPoint>, Arc<OwnerToken>) {
        let id = BufferId::generate();
        let token = Arc::new(OwnerToken::new(id));
        let point = Arc::new(AllocationPoint::new(id, 1024, Arc::downgrade(&token)));
        (point, token)
    }

    #[test]
    fn test_buffer_id_uniqueness() {
        let ids: Vec<BufferId> = (0..100).map(|_| BufferId::generate()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn test_allocatable_targets() {
        assert!(AllocationStatus::Host.is_allocatable());
        assert!(AllocationStatus::Device.is_allocatable());
        assert!(!AllocationStatus::Delayed.is_allocatable());
        assert!(!AllocationStatus::Constant.is_allocatable());
        assert!(!AllocationStatus::Undefined.is_allocatable());
        assert!(!AllocationStatus::Deallocated.is_allocatable());
    }

    #[test]
    fn test_concurrent_ticks_do_not_serialize() {
        let state = AccessState::new();
        state.tick();
        state.tick();
        state.tick();
        assert_eq!(state.active_ticks(), 3);
        state.tack();
        state.tack();
        state.tack();
        assert_eq!(state.active_ticks(), 0);
    }

    #[test]
    fn test_toe_excludes_new_ticks() {
        let (point, _token) = test_point();
        let guard = point.access().request_toe();
        assert!(point.access().is_toe_held());

        let racer = Arc::clone(&point);
        let handle = thread::spawn(move || {
            racer.access().tick(); // blocks until the toe releases
            racer.access().tack();
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());

        drop(guard);
        handle.join().unwrap();
        assert!(!point.access().is_toe_held());
    }

    #[test]
    fn test_toe_waits_for_tick_drain() {
        let (point, _token) = test_point();
        point.access().tick();

        let locker = Arc::clone(&point);
        let handle = thread::spawn(move || {
            let _toe = locker.access().request_toe();
            // Granted only after the outstanding tick resolves to tack.
            assert_eq!(locker.access().active_ticks(), 0);
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());

        point.access().tack();
        handle.join().unwrap();
    }

    #[test]
    fn test_try_toe_skips_busy_points() {
        let state = AccessState::new();
        state.tick();
        assert!(state.try_request_toe().is_none());
        state.tack();

        let guard = state.try_request_toe().expect("idle point");
        assert!(state.try_request_toe().is_none());
        drop(guard);
        assert!(state.try_request_toe().is_some());
    }

    #[test]
    fn test_reachability_tracks_token() {
        let (point, token) = test_point();
        assert!(point.is_reachable());
        drop(token);
        assert!(!point.is_reachable());
    }

    #[test]
    fn test_written_side_marker() {
        let (point, _token) = test_point();
        assert_eq!(point.written_side(), MemoryClass::Host);
        point.mark_written(MemoryClass::Device);
        assert_eq!(point.written_side(), MemoryClass::Device);
    }

    #[test]
    fn test_access_session_raii() {
        let (point, _token) = test_point();
        {
            let _session = AccessSession::begin(Arc::clone(&point));
            assert_eq!(point.access().active_ticks(), 1);
        }
        assert_eq!(point.access().active_ticks(), 0);
    }

    #[test]
    fn test_timers_harvest_and_reset() {
        let (point, _token) = test_point();
        point.record_access();
        point.record_access();
        point.mark_written(MemoryClass::Host);
        assert_eq!(point.take_timer_short(), 3);
        assert_eq!(point.take_timer_short(), 0);
        assert_eq!(point.take_timer_long(), 3);
    }
}
