//! CPU mirror transport
//!
//! Reference [`MemoryTransport`] implementation with no real accelerator
//! behind it. Each simulated device gets its own address space mirrored in
//! host RAM; bytes still only move between spaces through explicit copies,
//! so the allocator's residency and synchronization logic is exercised for
//! real. Asynchronous copies are performed eagerly (there is no DMA engine)
//! and return an already-completed event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{Result, TransportError};
use crate::event::TransferEvent;
use crate::region::{DeviceRegion, HostRegion};
use crate::transport::{DeviceInfo, MemoryTransport, TransportKind};

/// Nominal memory reported per simulated device: 8 GB
const MIRROR_DEVICE_BYTES: u64 = 8 * 1024 * 1024 * 1024;

struct MirrorDevice {
    info: DeviceInfo,
    bytes_in_use: Arc<AtomicU64>,
}

/// CPU-backed transport simulating one or more devices
///
/// # Example
/// ```
/// use jitmem_transport::{MemoryTransport, MirrorTransport};
///
/// let transport = MirrorTransport::new(2);
/// assert_eq!(transport.device_count(), 2);
///
/// let mut host = transport.alloc_host(8).unwrap();
/// host.as_mut_slice().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
///
/// let mut dev = transport.alloc_device(1, 8).unwrap();
/// transport.copy_h2d(&host, 0, &mut dev, 0, 8).unwrap();
/// ```
pub struct MirrorTransport {
    devices: Vec<MirrorDevice>,
    host_bytes_in_use: Arc<AtomicU64>,
}

impl MirrorTransport {
    /// Create a transport with the given number of simulated devices
    pub fn new(device_count: usize) -> Self {
        let devices = (0..device_count)
            .map(|id| MirrorDevice {
                info: DeviceInfo {
                    name: format!("MIRROR-{id}"),
                    device_id: id,
                    kind: TransportKind::Mirror,
                    total_bytes: MIRROR_DEVICE_BYTES,
                    unified_memory: false,
                },
                bytes_in_use: Arc::new(AtomicU64::new(0)),
            })
            .collect();

        Self { devices, host_bytes_in_use: Arc::new(AtomicU64::new(0)) }
    }

    fn device(&self, device_id: usize) -> Result<&MirrorDevice> {
        self.devices
            .get(device_id)
            .ok_or_else(|| TransportError::unknown_device(device_id, self.devices.len()))
    }

    fn check_range(offset: usize, len: usize, capacity: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > capacity) {
            return Err(TransportError::out_of_bounds(offset, len, capacity));
        }
        Ok(())
    }
}

impl Default for MirrorTransport {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryTransport for MirrorTransport {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, device_id: usize) -> Result<DeviceInfo> {
        Ok(self.device(device_id)?.info.clone())
    }

    fn alloc_host(&self, size: usize) -> Result<HostRegion> {
        if size == 0 {
            return Err(TransportError::ZeroSized);
        }
        trace!(bytes = size, "Allocating host region");
        Ok(HostRegion::with_accounting(size, Arc::clone(&self.host_bytes_in_use)))
    }

    fn alloc_device(&self, device_id: usize, size: usize) -> Result<DeviceRegion> {
        if size == 0 {
            return Err(TransportError::ZeroSized);
        }
        let device = self.device(device_id)?;
        trace!(device = device_id, bytes = size, "Allocating device region");
        Ok(DeviceRegion::with_accounting(device_id, size, Arc::clone(&device.bytes_in_use)))
    }

    fn host_bytes_in_use(&self) -> u64 {
        self.host_bytes_in_use.load(Ordering::Acquire)
    }

    fn device_bytes_in_use(&self, device_id: usize) -> u64 {
        self.devices
            .get(device_id)
            .map(|d| d.bytes_in_use.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn copy_h2d(
        &self,
        src: &HostRegion,
        src_offset: usize,
        dst: &mut DeviceRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.device(dst.device_id())?;
        Self::check_range(src_offset, len, src.len())?;
        Self::check_range(dst_offset, len, dst.len())?;
        dst.as_mut_slice()[dst_offset..dst_offset + len]
            .copy_from_slice(&src.as_slice()[src_offset..src_offset + len]);
        trace!(device = dst.device_id(), bytes = len, "h2d copy");
        Ok(())
    }

    fn copy_d2h(
        &self,
        src: &DeviceRegion,
        src_offset: usize,
        dst: &mut HostRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.device(src.device_id())?;
        Self::check_range(src_offset, len, src.len())?;
        Self::check_range(dst_offset, len, dst.len())?;
        dst.as_mut_slice()[dst_offset..dst_offset + len]
            .copy_from_slice(&src.as_slice()[src_offset..src_offset + len]);
        trace!(device = src.device_id(), bytes = len, "d2h copy");
        Ok(())
    }

    fn copy_d2d(
        &self,
        src: &DeviceRegion,
        src_offset: usize,
        dst: &mut DeviceRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.device(src.device_id())?;
        self.device(dst.device_id())?;
        Self::check_range(src_offset, len, src.len())?;
        Self::check_range(dst_offset, len, dst.len())?;
        dst.as_mut_slice()[dst_offset..dst_offset + len]
            .copy_from_slice(&src.as_slice()[src_offset..src_offset + len]);
        trace!(src = src.device_id(), dst = dst.device_id(), bytes = len, "d2d copy");
        Ok(())
    }

    fn copy_h2d_async(
        &self,
        src: &HostRegion,
        src_offset: usize,
        dst: &mut DeviceRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<TransferEvent> {
        // No DMA engine: perform eagerly, hand back a completed event.
        self.copy_h2d(src, src_offset, dst, dst_offset, len)?;
        Ok(TransferEvent::completed())
    }

    fn copy_d2h_async(
        &self,
        src: &DeviceRegion,
        src_offset: usize,
        dst: &mut HostRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<TransferEvent> {
        self.copy_d2h(src, src_offset, dst, dst_offset, len)?;
        Ok(TransferEvent::completed())
    }
}

impl std::fmt::Debug for MirrorTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorTransport")
            .field("devices", &self.devices.len())
            .field("host_bytes_in_use", &self.host_bytes_in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_count_and_info() {
        let transport = MirrorTransport::new(3);
        assert_eq!(transport.device_count(), 3);

        let info = transport.device_info(2).unwrap();
        assert_eq!(info.name, "MIRROR-2");
        assert_eq!(info.kind, TransportKind::Mirror);
        assert!(!info.unified_memory);

        assert!(matches!(
            transport.device_info(3),
            Err(TransportError::UnknownDevice { device_id: 3, available: 3 })
        ));
    }

    #[test]
    fn test_roundtrip_copy() {
        let transport = MirrorTransport::new(1);
        let mut host = transport.alloc_host(16).unwrap();
        host.as_mut_slice().iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);

        let mut dev = transport.alloc_device(0, 16).unwrap();
        transport.copy_h2d(&host, 0, &mut dev, 0, 16).unwrap();

        let mut back = transport.alloc_host(16).unwrap();
        transport.copy_d2h(&dev, 0, &mut back, 0, 16).unwrap();
        assert_eq!(back.as_slice(), host.as_slice());
    }

    #[test]
    fn test_partial_copy_with_offsets() {
        let transport = MirrorTransport::new(1);
        let mut host = transport.alloc_host(8).unwrap();
        host.as_mut_slice().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut dev = transport.alloc_device(0, 8).unwrap();
        transport.copy_h2d(&host, 4, &mut dev, 0, 4).unwrap();
        assert_eq!(&dev.as_slice()[..4], &[5, 6, 7, 8]);
        assert_eq!(&dev.as_slice()[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let transport = MirrorTransport::new(1);
        let host = transport.alloc_host(8).unwrap();
        let mut dev = transport.alloc_device(0, 8).unwrap();

        let result = transport.copy_h2d(&host, 4, &mut dev, 0, 8);
        assert!(matches!(result, Err(TransportError::OutOfBounds { .. })));
    }

    #[test]
    fn test_byte_accounting() {
        let transport = MirrorTransport::new(2);
        let host = transport.alloc_host(100).unwrap();
        let dev0 = transport.alloc_device(0, 200).unwrap();
        let dev1 = transport.alloc_device(1, 300).unwrap();

        assert_eq!(transport.host_bytes_in_use(), 100);
        assert_eq!(transport.device_bytes_in_use(0), 200);
        assert_eq!(transport.device_bytes_in_use(1), 300);

        drop(dev0);
        assert_eq!(transport.device_bytes_in_use(0), 0);
        drop(host);
        drop(dev1);
        assert_eq!(transport.host_bytes_in_use(), 0);
        assert_eq!(transport.device_bytes_in_use(1), 0);
    }

    #[test]
    fn test_zero_sized_rejected() {
        let transport = MirrorTransport::new(1);
        assert!(matches!(transport.alloc_host(0), Err(TransportError::ZeroSized)));
        assert!(matches!(transport.alloc_device(0, 0), Err(TransportError::ZeroSized)));
    }

    #[test]
    fn test_random_offset_copies() {
        use rand::Rng;

        let transport = MirrorTransport::new(1);
        let mut rng = rand::thread_rng();
        let mut host = transport.alloc_host(1024).unwrap();
        rng.fill(host.as_mut_slice());
        let mut dev = transport.alloc_device(0, 1024).unwrap();
        let mut back = transport.alloc_host(1024).unwrap();

        for _ in 0..50 {
            let len = rng.gen_range(1..=256);
            let src_offset = rng.gen_range(0..=1024 - len);
            let dst_offset = rng.gen_range(0..=1024 - len);
            transport.copy_h2d(&host, src_offset, &mut dev, dst_offset, len).unwrap();
            transport.copy_d2h(&dev, dst_offset, &mut back, 0, len).unwrap();
            assert_eq!(
                &back.as_slice()[..len],
                &host.as_slice()[src_offset..src_offset + len]
            );
        }
    }

    #[test]
    fn test_async_copy_completes_eagerly() {
        let transport = MirrorTransport::new(1);
        let mut host = transport.alloc_host(4).unwrap();
        host.as_mut_slice().copy_from_slice(&[9, 9, 9, 9]);
        let mut dev = transport.alloc_device(0, 4).unwrap();

        let event = transport.copy_h2d_async(&host, 0, &mut dev, 0, 4).unwrap();
        assert!(event.is_complete());
        assert_eq!(dev.as_slice(), &[9, 9, 9, 9]);
    }
}
