//! Owned host and device byte regions
//!
//! A region is an owned allocation in one address space with a stable base
//! address for its whole lifetime. The allocator above hands out raw pointers
//! into regions; stability is what makes those pointers meaningful across the
//! Tick/Tack access protocol. Dropping a region releases its bytes and
//! decrements the owning transport's accounting counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

/// A pinned-style host memory region
///
/// Backed by an owned heap buffer with a stable address. Stands in for
/// page-locked host memory on real device backends; the transport trait is
/// where an actual pinned allocation would be made.
pub struct HostRegion {
    data: Box<[u8]>,
    accounting: Option<Arc<AtomicU64>>,
}

impl HostRegion {
    /// Allocate a zeroed host region
    pub fn new_zeroed(size: usize) -> Self {
        Self { data: vec![0u8; size].into_boxed_slice(), accounting: None }
    }

    /// Allocate a zeroed host region tracked by an accounting counter
    ///
    /// The counter is incremented now and decremented when the region drops.
    pub fn with_accounting(size: usize, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(size as u64, Ordering::AcqRel);
        Self { data: vec![0u8; size].into_boxed_slice(), accounting: Some(counter) }
    }

    /// Region size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base address of the region
    ///
    /// The pointer is stable until the region is dropped. Writes through it
    /// must be coordinated by the caller's access protocol.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.data.as_ptr().cast_mut()
    }

    /// Immutable view of the region's bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the region's bytes
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if let Some(counter) = &self.accounting {
            counter.fetch_sub(self.data.len() as u64, Ordering::AcqRel);
        }
        trace!(bytes = self.data.len(), "Dropping host region");
    }
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion").field("len", &self.data.len()).finish()
    }
}

/// A device memory region, tagged with its device ordinal
///
/// Device bytes are only observable through transport copy operations. The
/// CPU reference transport mirrors device space in host RAM, but the API
/// keeps the spaces distinct so residency logic stays honest.
pub struct DeviceRegion {
    device_id: usize,
    data: Box<[u8]>,
    accounting: Option<Arc<AtomicU64>>,
}

impl DeviceRegion {
    /// Allocate a zeroed device region
    pub fn new_zeroed(device_id: usize, size: usize) -> Self {
        Self { device_id, data: vec![0u8; size].into_boxed_slice(), accounting: None }
    }

    /// Allocate a zeroed device region tracked by an accounting counter
    pub fn with_accounting(device_id: usize, size: usize, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(size as u64, Ordering::AcqRel);
        Self { device_id, data: vec![0u8; size].into_boxed_slice(), accounting: Some(counter) }
    }

    /// Device this region lives on
    #[inline]
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Region size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base address of the region in device space
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.data.as_ptr().cast_mut()
    }

    /// Immutable view of the region's bytes (mirrored space)
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the region's bytes (mirrored space)
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for DeviceRegion {
    fn drop(&mut self) {
        if let Some(counter) = &self.accounting {
            counter.fetch_sub(self.data.len() as u64, Ordering::AcqRel);
        }
        trace!(device = self.device_id, bytes = self.data.len(), "Dropping device region");
    }
}

impl std::fmt::Debug for DeviceRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegion")
            .field("device_id", &self.device_id)
            .field("len", &self.data.len())
            .finish()
    }
}
