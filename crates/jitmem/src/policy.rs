//! Placement policy
//!
//! Decides where newly requested memory lands given the configured memory
//! model, and whether a host-resident buffer should be promoted to device on
//! a device-side access.

use crate::config::MemoryModel;
use crate::error::{Error, Result};
use crate::point::{AllocationPoint, AllocationStatus};

/// Placement decisions for the allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementPolicy;

impl PlacementPolicy {
    /// Decide the initial placement for a new buffer
    ///
    /// - `Immediate`: place in the requested location as-is
    /// - `Delayed`: always host first; promotion happens on later access
    ///
    /// Requesting a non-allocatable target is a programming error and fails
    /// fast.
    pub fn initial_placement(
        model: MemoryModel,
        requested: AllocationStatus,
    ) -> Result<AllocationStatus> {
        if !requested.is_allocatable() {
            return Err(Error::unsupported_placement(requested));
        }
        match model {
            MemoryModel::Immediate => Ok(requested),
            MemoryModel::Delayed => Ok(AllocationStatus::Host),
        }
    }

    /// Whether a host-resident buffer should move to device when accessed
    /// from the device side
    ///
    /// Conservative default: promote on first device-side access. A device
    /// access requires device residency anyway, so deferring further would
    /// only stack a staging copy on every access.
    pub fn should_promote(_point: &AllocationPoint) -> bool {
        true
    }
}
