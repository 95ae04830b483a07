//! Error types for allocator operations

use crate::point::{AllocationStatus, BufferId, MemoryClass};

/// Result type for allocator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Allocator errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocation requested for a non-allocatable placement
    #[error("Unsupported placement target: {status:?}")]
    UnsupportedPlacement {
        /// The rejected target status
        status: AllocationStatus,
    },

    /// A native copy failed; the device state is usually unrecoverable,
    /// so the caller decides whether to retry
    #[error("Native transfer failed: {0}")]
    Transfer(#[from] jitmem_transport::TransportError),

    /// Allocation cannot fit within the class cap, even after forcing
    /// immediate reclamation
    #[error("Resource exhausted: {requested} bytes requested in {class} space, cap {cap} bytes")]
    ResourceExhausted {
        /// Requested size
        requested: usize,
        /// Configured cap for the class
        cap: u64,
        /// Memory class that ran out
        class: MemoryClass,
    },

    /// Configuration is write-once-before-use
    #[error("Configuration is sealed: allocations have already occurred")]
    ConfigurationSealed,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The buffer is not tracked by this allocator
    #[error("Unknown buffer {0}")]
    UnknownBuffer(BufferId),

    /// The buffer was already released
    #[error("Buffer {0} was already released")]
    BufferReleased(BufferId),
}

impl Error {
    /// Create an unsupported-placement error
    #[inline]
    pub fn unsupported_placement(status: AllocationStatus) -> Self {
        Self::UnsupportedPlacement { status }
    }

    /// Create a resource-exhausted error
    #[inline]
    pub fn resource_exhausted(requested: usize, cap: u64, class: MemoryClass) -> Self {
        Self::ResourceExhausted { requested, cap, class }
    }

    /// Check if the error may succeed on retry after memory is freed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}
