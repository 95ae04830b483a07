//! Allocator configuration
//!
//! Configuration is process-wide per allocator instance and write-once: it
//! can be replaced through [`Allocator::apply_configuration`] only before the
//! first allocation, and is read under a shared lock afterwards.
//!
//! [`Allocator::apply_configuration`]: crate::Allocator::apply_configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Initial placement strategy for new buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MemoryModel {
    /// Place directly in the location requested by the caller
    #[default]
    Immediate,

    /// Always place new buffers on host first; promotion to device happens
    /// via access-driven heuristics
    Delayed,
}

/// How readily memory is reclaimed
///
/// Ordered: higher levels lower the temperature threshold required to keep a
/// buffer alive, so a larger fraction of the population becomes eligible per
/// scan. At [`Aggressiveness::Immediate`] everything colder than the running
/// average is eligible.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Aggressiveness {
    /// Reclaim as little as possible
    Lazy,
    /// Mild reclamation pressure
    #[default]
    Mild,
    /// Prefer reclaiming over keeping
    Aggressive,
    /// Raised automatically when object counts or bytes near the cap
    Urgent,
    /// Maximum: forced above 85% of the class cap
    Immediate,
}

impl Aggressiveness {
    /// Number of aggressiveness levels
    pub const CARDINALITY: usize = 5;

    /// Position in the ordering, starting from `Lazy` = 0
    pub fn ordinal(self) -> usize {
        match self {
            Aggressiveness::Lazy => 0,
            Aggressiveness::Mild => 1,
            Aggressiveness::Aggressive => 2,
            Aggressiveness::Urgent => 3,
            Aggressiveness::Immediate => 4,
        }
    }

    /// Reclamation threshold for a given average temperature
    ///
    /// `average / (CARDINALITY - ordinal)`: the divisor shrinks as
    /// aggressiveness rises, so the cutoff climbs toward the raw average and
    /// all cold objects become eligible at the maximum level.
    pub fn threshold(self, average: f32) -> f32 {
        average / (Self::CARDINALITY - self.ordinal()) as f32
    }
}

/// Allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Initial placement model
    pub memory_model: MemoryModel,

    /// Maximum host bytes tracked by this allocator
    pub max_host_bytes: u64,

    /// Maximum device bytes tracked per device
    pub max_device_bytes: u64,

    /// Minimum time-to-live before a resident buffer may be evicted;
    /// also the floor for reclamation scan intervals
    pub min_ttl: Duration,

    /// Reclamation aggressiveness for host memory
    pub host_aggressiveness: Aggressiveness,

    /// Reclamation aggressiveness for device memory
    pub device_aggressiveness: Aggressiveness,

    /// Number of host buckets (thread-affinity groups) sharding
    /// host reclamation work
    pub host_buckets: usize,

    /// Device used for placements that do not name one explicitly
    pub initial_device: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            memory_model: MemoryModel::Immediate,
            max_host_bytes: 4 * 1024 * 1024 * 1024, // 4 GB
            max_device_bytes: 8 * 1024 * 1024 * 1024, // 8 GB per device
            min_ttl: Duration::from_secs(10),
            host_aggressiveness: Aggressiveness::Mild,
            device_aggressiveness: Aggressiveness::Mild,
            host_buckets: 4,
            initial_device: 0,
        }
    }
}

impl AllocatorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_host_bytes == 0 {
            return Err(Error::InvalidConfig("max_host_bytes must be non-zero".into()));
        }
        if self.max_device_bytes == 0 {
            return Err(Error::InvalidConfig("max_device_bytes must be non-zero".into()));
        }
        if self.host_buckets == 0 {
            return Err(Error::InvalidConfig("host_buckets must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AllocatorConfig::default();
        assert_eq!(config.memory_model, MemoryModel::Immediate);
        assert_eq!(config.max_host_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.host_buckets, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_caps() {
        let mut config = AllocatorConfig::default();
        config.max_host_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AllocatorConfig::default();
        config.host_buckets = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_aggressiveness_ordering() {
        assert!(Aggressiveness::Lazy < Aggressiveness::Mild);
        assert!(Aggressiveness::Mild < Aggressiveness::Aggressive);
        assert!(Aggressiveness::Aggressive < Aggressiveness::Urgent);
        assert!(Aggressiveness::Urgent < Aggressiveness::Immediate);
    }

    #[test]
    fn test_threshold_monotone_in_aggressiveness() {
        let average = 120.0;
        let levels = [
            Aggressiveness::Lazy,
            Aggressiveness::Mild,
            Aggressiveness::Aggressive,
            Aggressiveness::Urgent,
            Aggressiveness::Immediate,
        ];

        let thresholds: Vec<f32> = levels.iter().map(|a| a.threshold(average)).collect();
        for pair in thresholds.windows(2) {
            assert!(pair[1] >= pair[0]);
        }

        // Maximum aggressiveness: cutoff equals the raw average.
        assert_eq!(Aggressiveness::Immediate.threshold(average), average);
        // Minimum: a fifth of the average.
        assert_eq!(Aggressiveness::Lazy.threshold(average), average / 5.0);
    }
}
