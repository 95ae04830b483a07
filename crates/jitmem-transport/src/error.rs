//! Error types for transport operations

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport operation errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Referenced device does not exist
    #[error("Unknown device {device_id}: {available} device(s) available")]
    UnknownDevice {
        /// Requested device ordinal
        device_id: usize,
        /// Number of devices the transport exposes
        available: usize,
    },

    /// Region allocation failed
    #[error("Allocation of {size} bytes failed in {space} space")]
    AllocationFailed {
        /// Requested size
        size: usize,
        /// "host" or "device"
        space: &'static str,
    },

    /// Copy range falls outside a region
    #[error("Copy out of bounds: offset {offset} + len {len} exceeds region of {capacity} bytes")]
    OutOfBounds {
        /// Offset into the region
        offset: usize,
        /// Length of the copy
        len: usize,
        /// Region capacity
        capacity: usize,
    },

    /// The device reported a fault during a copy
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// Zero-length region requested
    #[error("Zero-sized region requested")]
    ZeroSized,
}

impl TransportError {
    /// Create an out-of-bounds error
    #[inline]
    pub fn out_of_bounds(offset: usize, len: usize, capacity: usize) -> Self {
        Self::OutOfBounds { offset, len, capacity }
    }

    /// Create an unknown-device error
    #[inline]
    pub fn unknown_device(device_id: usize, available: usize) -> Self {
        Self::UnknownDevice { device_id, available }
    }

    /// Check if the error is recoverable by retrying after freeing memory
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }
}
