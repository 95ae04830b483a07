//! Memory handler - the transfer engine
//!
//! The [`MemoryHandler`] trait is the allocator's seam to whatever moves
//! bytes: it populates new allocation points, relocates buffers between
//! memory classes, synchronizes device writes back to host mirrors, and
//! services raw copies. The default [`TransportHandler`] implements it on top
//! of any [`MemoryTransport`]; the façade can swap the handler under its
//! global write lock.
//!
//! Placement mutations (relocate, synchronize, free) happen inside the
//! point's Toe window so no compute thread ever observes a buffer
//! mid-relocation.

use std::sync::Arc;

use tracing::{debug, trace};

use jitmem_transport::{MemoryTransport, TransferEvent};

use crate::error::{Error, Result};
use crate::point::{AllocationPoint, AllocationStatus, MemoryClass};

/// Transfer engine contract
///
/// All methods may be called concurrently from multiple threads.
pub trait MemoryHandler: Send + Sync {
    /// Number of devices available to this handler
    fn device_count(&self) -> usize;

    /// Device used for placements that do not name one
    fn current_device(&self) -> usize;

    /// Preferred location for new buffers under the `Immediate` model
    fn initial_location(&self) -> AllocationStatus;

    /// Give a fresh point its first placement
    ///
    /// The point must not be published in the tracking table yet. With
    /// `initialize` set the new region's contents are guaranteed zero;
    /// otherwise they are whatever the transport hands out.
    fn populate(
        &self,
        point: &AllocationPoint,
        target: AllocationStatus,
        device_id: usize,
        initialize: bool,
    ) -> Result<()>;

    /// Move a buffer between memory classes
    ///
    /// Acquires the point's Toe; by the time this returns, every observer
    /// sees the new placement.
    fn relocate(&self, point: &AllocationPoint, target: MemoryClass, device_id: usize)
        -> Result<()>;

    /// Flush device-side writes back to the host mirror
    ///
    /// No-op if the buffer was already freed, has no device side, or the
    /// host side is already authoritative. Returns whether a copy occurred.
    fn synchronize_host_data(&self, point: &AllocationPoint) -> Result<bool>;

    /// Push host-side writes to the device copy
    ///
    /// The inverse of [`MemoryHandler::synchronize_host_data`]: a no-op
    /// unless the host side is authoritative and a device copy exists.
    /// Returns whether a copy occurred.
    fn synchronize_device_data(&self, point: &AllocationPoint) -> Result<bool>;

    /// Blocking copy of raw bytes into the buffer's current residence
    fn memcpy_blocking(&self, dst: &AllocationPoint, src: &[u8], dst_offset: usize) -> Result<()>;

    /// Asynchronous copy of raw bytes into the buffer's current residence
    ///
    /// Callers must not assume completion until the returned event resolves.
    fn memcpy_async(
        &self,
        dst: &AllocationPoint,
        src: &[u8],
        dst_offset: usize,
    ) -> Result<TransferEvent>;

    /// Copy ordered after a prior transfer: waits for `after` first
    fn memcpy_special(
        &self,
        dst: &AllocationPoint,
        src: &[u8],
        dst_offset: usize,
        after: Option<&TransferEvent>,
    ) -> Result<()>;

    /// Device-to-device copy between two device-resident buffers
    fn memcpy_device(
        &self,
        dst: &AllocationPoint,
        src: &AllocationPoint,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Mark the host side as most recently written
    fn tick_host_write(&self, point: &AllocationPoint);

    /// Mark the device side as most recently written
    fn tick_device_write(&self, point: &AllocationPoint);

    /// Release one memory class of a point, returning bytes freed
    ///
    /// The caller must hold the point's Toe. Freeing the device side of a
    /// point that keeps a host mirror demotes its status to `Host`; freeing
    /// the last side marks it `Deallocated`.
    fn free(&self, point: &AllocationPoint, class: MemoryClass) -> Result<u64>;

    /// Release both sides of a point, returning bytes freed
    ///
    /// The caller must hold the point's Toe.
    fn free_all(&self, point: &AllocationPoint) -> Result<u64>;

    /// Host bytes currently held in live regions
    fn host_bytes(&self) -> u64;

    /// Device bytes currently held in live regions on one device
    fn device_bytes(&self, device_id: usize) -> u64;
}

/// Default handler: drives a [`MemoryTransport`]
pub struct TransportHandler {
    transport: Arc<dyn MemoryTransport>,
    current_device: usize,
}

impl TransportHandler {
    /// Create a handler over a transport, pinned to a current device
    pub fn new(transport: Arc<dyn MemoryTransport>, current_device: usize) -> Self {
        Self { transport, current_device }
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn MemoryTransport> {
        &self.transport
    }

    /// Whether a device shares one address space with the host
    ///
    /// Unified devices need no synchronization copies.
    fn is_unified(&self, device_id: usize) -> bool {
        self.transport
            .device_info(device_id)
            .map(|info| info.unified_memory)
            .unwrap_or(false)
    }

    /// Stage host bytes and push them to a device region
    fn staged_h2d(
        &self,
        src: &[u8],
        dst: &mut jitmem_transport::DeviceRegion,
        dst_offset: usize,
    ) -> Result<()> {
        let mut stage = self.transport.alloc_host(src.len())?;
        stage.as_mut_slice().copy_from_slice(src);
        self.transport.copy_h2d(&stage, 0, dst, dst_offset, src.len())?;
        Ok(())
    }
}

impl MemoryHandler for TransportHandler {
    fn device_count(&self) -> usize {
        self.transport.device_count()
    }

    fn current_device(&self) -> usize {
        self.current_device
    }

    fn initial_location(&self) -> AllocationStatus {
        if self.transport.device_count() > 0 {
            AllocationStatus::Device
        } else {
            AllocationStatus::Host
        }
    }

    fn populate(
        &self,
        point: &AllocationPoint,
        target: AllocationStatus,
        device_id: usize,
        initialize: bool,
    ) -> Result<()> {
        let mut state = point.state().write();
        match target {
            AllocationStatus::Host => {
                let mut region = self.transport.alloc_host(point.size_bytes())?;
                // The zero-fill guarantee is the handler's, not the
                // transport's: a backend may hand out recycled regions.
                if initialize {
                    region.as_mut_slice().fill(0);
                }
                state.host = Some(region);
                state.status = AllocationStatus::Host;
                state.device_id = None;
                point.mark_written(MemoryClass::Host);
            }
            AllocationStatus::Device => {
                let mut region = self.transport.alloc_device(device_id, point.size_bytes())?;
                if initialize {
                    region.as_mut_slice().fill(0);
                }
                state.device = Some(region);
                state.status = AllocationStatus::Device;
                state.device_id = Some(device_id);
                point.mark_written(MemoryClass::Device);
            }
            other => return Err(Error::unsupported_placement(other)),
        }
        trace!(
            id = %point.id(),
            target = ?target,
            bytes = point.size_bytes(),
            initialize,
            "Populated allocation point"
        );
        Ok(())
    }

    fn relocate(
        &self,
        point: &AllocationPoint,
        target: MemoryClass,
        device_id: usize,
    ) -> Result<()> {
        let _toe = point.access().request_toe();
        let mut state = point.state().write();
        let len = point.size_bytes();

        match (state.status, target) {
            (AllocationStatus::Host, MemoryClass::Host)
            | (AllocationStatus::Device, MemoryClass::Device) => Ok(()),

            (AllocationStatus::Host, MemoryClass::Device) => {
                // Stage the device region locally and commit it together
                // with the status flip only after the copy succeeds: a
                // failed promotion must leave the point a plain host
                // resident, not a host resident holding device bytes that
                // device scans (keyed on status) would never revisit.
                let mut device_region = match state.device.take() {
                    Some(existing) => existing,
                    None => self.transport.alloc_device(device_id, len)?,
                };
                let host_region =
                    state.host.as_ref().ok_or(Error::BufferReleased(point.id()))?;
                self.transport.copy_h2d(host_region, 0, &mut device_region, 0, len)?;

                // The host side stays behind as a mirror; device is now
                // where compute reads and writes land.
                state.device = Some(device_region);
                state.status = AllocationStatus::Device;
                state.device_id = Some(device_id);
                point.set_written_side(MemoryClass::Device);
                debug!(id = %point.id(), device = device_id, bytes = len, "Promoted buffer to device");
                Ok(())
            }

            (AllocationStatus::Device, MemoryClass::Host) => {
                if state.host.is_none() {
                    state.host = Some(self.transport.alloc_host(len)?);
                }
                {
                    let crate::point::PointState { host, device, .. } = &mut *state;
                    let device_region =
                        device.as_ref().ok_or(Error::BufferReleased(point.id()))?;
                    let host_region = host.as_mut().ok_or(Error::BufferReleased(point.id()))?;
                    self.transport.copy_d2h(device_region, 0, host_region, 0, len)?;
                }
                // Device bytes are released; host becomes the residence.
                state.device = None;
                state.device_id = None;
                state.status = AllocationStatus::Host;
                point.set_written_side(MemoryClass::Host);
                debug!(id = %point.id(), bytes = len, "Evicted buffer back to host");
                Ok(())
            }

            (AllocationStatus::Deallocated, _) => Err(Error::BufferReleased(point.id())),
            (other, _) => Err(Error::unsupported_placement(other)),
        }
    }

    fn synchronize_host_data(&self, point: &AllocationPoint) -> Result<bool> {
        if point.status() == AllocationStatus::Deallocated {
            return Ok(false);
        }
        let _toe = point.access().request_toe();
        let mut state = point.state().write();

        if state.device.is_none() || point.written_side() != MemoryClass::Device {
            return Ok(false);
        }
        if state.device_id.is_some_and(|id| self.is_unified(id)) {
            point.set_written_side(MemoryClass::Host);
            return Ok(false);
        }
        let len = point.size_bytes();
        if state.host.is_none() {
            state.host = Some(self.transport.alloc_host(len)?);
        }
        {
            let crate::point::PointState { host, device, .. } = &mut *state;
            let device_region = device.as_ref().ok_or(Error::BufferReleased(point.id()))?;
            let host_region = host.as_mut().ok_or(Error::BufferReleased(point.id()))?;
            self.transport.copy_d2h(device_region, 0, host_region, 0, len)?;
        }
        point.set_written_side(MemoryClass::Host);
        trace!(id = %point.id(), bytes = len, "Synchronized device writes to host");
        Ok(true)
    }

    fn synchronize_device_data(&self, point: &AllocationPoint) -> Result<bool> {
        if point.status() == AllocationStatus::Deallocated {
            return Ok(false);
        }
        let _toe = point.access().request_toe();
        let mut state = point.state().write();

        if state.device.is_none()
            || state.host.is_none()
            || point.written_side() != MemoryClass::Host
        {
            return Ok(false);
        }
        if state.device_id.is_some_and(|id| self.is_unified(id)) {
            point.set_written_side(MemoryClass::Device);
            return Ok(false);
        }
        let len = point.size_bytes();
        {
            let crate::point::PointState { host, device, .. } = &mut *state;
            let host_region = host.as_ref().ok_or(Error::BufferReleased(point.id()))?;
            let device_region = device.as_mut().ok_or(Error::BufferReleased(point.id()))?;
            self.transport.copy_h2d(host_region, 0, device_region, 0, len)?;
        }
        point.set_written_side(MemoryClass::Device);
        trace!(id = %point.id(), bytes = len, "Synchronized host writes to device");
        Ok(true)
    }

    fn memcpy_blocking(&self, dst: &AllocationPoint, src: &[u8], dst_offset: usize) -> Result<()> {
        let mut state = dst.state().write();
        match state.status {
            AllocationStatus::Device => {
                let device_region =
                    state.device.as_mut().ok_or(Error::BufferReleased(dst.id()))?;
                self.staged_h2d(src, device_region, dst_offset)?;
                dst.mark_written(MemoryClass::Device);
            }
            AllocationStatus::Host => {
                let host_region = state.host.as_mut().ok_or(Error::BufferReleased(dst.id()))?;
                let end = dst_offset
                    .checked_add(src.len())
                    .filter(|&end| end <= host_region.len())
                    .ok_or_else(|| {
                        Error::Transfer(jitmem_transport::TransportError::out_of_bounds(
                            dst_offset,
                            src.len(),
                            host_region.len(),
                        ))
                    })?;
                host_region.as_mut_slice()[dst_offset..end].copy_from_slice(src);
                dst.mark_written(MemoryClass::Host);
            }
            AllocationStatus::Deallocated => return Err(Error::BufferReleased(dst.id())),
            other => return Err(Error::unsupported_placement(other)),
        }
        Ok(())
    }

    fn memcpy_async(
        &self,
        dst: &AllocationPoint,
        src: &[u8],
        dst_offset: usize,
    ) -> Result<TransferEvent> {
        let mut state = dst.state().write();
        match state.status {
            AllocationStatus::Device => {
                let device_region =
                    state.device.as_mut().ok_or(Error::BufferReleased(dst.id()))?;
                let mut stage = self.transport.alloc_host(src.len())?;
                stage.as_mut_slice().copy_from_slice(src);
                let event =
                    self.transport
                        .copy_h2d_async(&stage, 0, device_region, dst_offset, src.len())?;
                dst.mark_written(MemoryClass::Device);
                Ok(event)
            }
            _ => {
                drop(state);
                self.memcpy_blocking(dst, src, dst_offset)?;
                Ok(TransferEvent::completed())
            }
        }
    }

    fn memcpy_special(
        &self,
        dst: &AllocationPoint,
        src: &[u8],
        dst_offset: usize,
        after: Option<&TransferEvent>,
    ) -> Result<()> {
        if let Some(event) = after {
            event.wait();
        }
        self.memcpy_blocking(dst, src, dst_offset)
    }

    fn memcpy_device(
        &self,
        dst: &AllocationPoint,
        src: &AllocationPoint,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        if src.id() == dst.id() {
            // Same buffer: stage through host rather than aliasing the
            // device region.
            let mut state = dst.state().write();
            let region = state.device.as_mut().ok_or(Error::BufferReleased(dst.id()))?;
            let mut stage = self.transport.alloc_host(len)?;
            self.transport.copy_d2h(region, src_offset, &mut stage, 0, len)?;
            self.transport.copy_h2d(&stage, 0, region, dst_offset, len)?;
            dst.mark_written(MemoryClass::Device);
            return Ok(());
        }

        // Consistent lock order by buffer id prevents deadlock between
        // concurrent copies in opposite directions.
        let (src_state, mut dst_state);
        if src.id() < dst.id() {
            src_state = src.state().write();
            dst_state = dst.state().write();
        } else {
            dst_state = dst.state().write();
            src_state = src.state().write();
        }

        let src_region = src_state.device.as_ref().ok_or(Error::BufferReleased(src.id()))?;
        let dst_region = dst_state.device.as_mut().ok_or(Error::BufferReleased(dst.id()))?;
        self.transport.copy_d2d(src_region, src_offset, dst_region, dst_offset, len)?;
        dst.mark_written(MemoryClass::Device);
        Ok(())
    }

    fn tick_host_write(&self, point: &AllocationPoint) {
        point.mark_written(MemoryClass::Host);
    }

    fn tick_device_write(&self, point: &AllocationPoint) {
        point.mark_written(MemoryClass::Device);
    }

    fn free(&self, point: &AllocationPoint, class: MemoryClass) -> Result<u64> {
        let mut state = point.state().write();
        let mut freed = 0u64;
        match class {
            MemoryClass::Host => {
                if let Some(host) = state.host.take() {
                    freed = host.len() as u64;
                }
                if state.device.is_none() {
                    state.status = AllocationStatus::Deallocated;
                    state.device_id = None;
                }
            }
            MemoryClass::Device => {
                if let Some(device) = state.device.take() {
                    freed = device.len() as u64;
                }
                state.device_id = None;
                state.status = if state.host.is_some() {
                    AllocationStatus::Host
                } else {
                    AllocationStatus::Deallocated
                };
            }
        }
        trace!(id = %point.id(), class = %class, bytes = freed, "Freed memory class");
        Ok(freed)
    }

    fn free_all(&self, point: &AllocationPoint) -> Result<u64> {
        // Device bytes go first; once they are gone the host mirror follows.
        let device_freed = self.free(point, MemoryClass::Device)?;
        let host_freed = self.free(point, MemoryClass::Host)?;
        Ok(device_freed + host_freed)
    }

    fn host_bytes(&self) -> u64 {
        self.transport.host_bytes_in_use()
    }

    fn device_bytes(&self, device_id: usize) -> u64 {
        self.transport.device_bytes_in_use(device_id)
    }
}

impl std::fmt::Debug for TransportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandler")
            .field("devices", &self.device_count())
            .field("current_device", &self.current_device)
            .finish()
    }
}
