//! Memory transport abstraction
//!
//! The [`MemoryTransport`] trait is the seam between the allocator and
//! whatever actually moves bytes: a CUDA driver, a Metal queue, or the CPU
//! mirror backend used in tests. The allocator treats it as an opaque
//! collaborator: it asks for regions, asks for copies, and observes transfer
//! completion through [`TransferEvent`]s - nothing else.

use crate::error::Result;
use crate::event::TransferEvent;
use crate::region::{DeviceRegion, HostRegion};

/// Transport backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// CPU mirror backend (no real device)
    Mirror,
    /// NVIDIA CUDA backend
    Cuda,
    /// Apple Metal backend
    Metal,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Mirror => write!(f, "Mirror"),
            TransportKind::Cuda => write!(f, "CUDA"),
            TransportKind::Metal => write!(f, "Metal"),
        }
    }
}

/// Capabilities of one device exposed by a transport
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name (e.g. "MIRROR-0", "NVIDIA RTX 4090")
    pub name: String,
    /// Device ordinal
    pub device_id: usize,
    /// Transport backend type
    pub kind: TransportKind,
    /// Total device memory in bytes
    pub total_bytes: u64,
    /// Whether host and device share one physical address space
    ///
    /// When `true`, host synchronization is a no-op for the allocator.
    pub unified_memory: bool,
}

/// Abstract memory transport
///
/// Implementations handle backend-specific allocation and copies.
/// All methods may be called concurrently from multiple threads.
pub trait MemoryTransport: Send + Sync {
    /// Number of devices this transport exposes
    fn device_count(&self) -> usize;

    /// Describe one device
    fn device_info(&self, device_id: usize) -> Result<DeviceInfo>;

    /// Allocate a zeroed host-space region
    fn alloc_host(&self, size: usize) -> Result<HostRegion>;

    /// Allocate a zeroed device-space region
    fn alloc_device(&self, device_id: usize, size: usize) -> Result<DeviceRegion>;

    /// Total host bytes currently held in live regions
    fn host_bytes_in_use(&self) -> u64;

    /// Total device bytes currently held in live regions on one device
    fn device_bytes_in_use(&self, device_id: usize) -> u64;

    /// Blocking host-to-device copy
    fn copy_h2d(
        &self,
        src: &HostRegion,
        src_offset: usize,
        dst: &mut DeviceRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Blocking device-to-host copy
    fn copy_d2h(
        &self,
        src: &DeviceRegion,
        src_offset: usize,
        dst: &mut HostRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Blocking device-to-device copy
    fn copy_d2d(
        &self,
        src: &DeviceRegion,
        src_offset: usize,
        dst: &mut DeviceRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Asynchronous host-to-device copy
    ///
    /// Returns before the transfer necessarily completes; poll or wait on the
    /// returned event before touching the destination.
    fn copy_h2d_async(
        &self,
        src: &HostRegion,
        src_offset: usize,
        dst: &mut DeviceRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<TransferEvent>;

    /// Asynchronous device-to-host copy
    fn copy_d2h_async(
        &self,
        src: &DeviceRegion,
        src_offset: usize,
        dst: &mut HostRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<TransferEvent>;
}
