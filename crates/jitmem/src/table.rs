//! Concurrent tracking table
//!
//! Single shared mutable structure touched by both compute threads and
//! reclamation workers. Lookups never block each other; writers may briefly
//! contend on a shard but never block readers. A lookup racing a removal
//! returns absent - removal always precedes pointer invalidation, so a stale
//! freed pointer can never be observed through the table.

use std::sync::Arc;

use dashmap::DashMap;

use crate::point::{AllocationPoint, AllocationStatus, BufferId};

/// Concurrent map from buffer identity to its allocation point
pub struct TrackingTable {
    points: DashMap<BufferId, Arc<AllocationPoint>>,
}

impl TrackingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self { points: DashMap::new() }
    }

    /// Insert a point under its identity
    pub fn put(&self, point: Arc<AllocationPoint>) {
        debug_assert!(
            point.status() != AllocationStatus::Deallocated,
            "deallocated points must not enter the table"
        );
        self.points.insert(point.id(), point);
    }

    /// Look up a point; absent during a concurrent remove is a valid outcome
    pub fn get(&self, id: BufferId) -> Option<Arc<AllocationPoint>> {
        self.points.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Remove a point, returning it if present
    pub fn remove(&self, id: BufferId) -> Option<Arc<AllocationPoint>> {
        self.points.remove(&id).map(|(_, point)| point)
    }

    /// Whether an identity is currently tracked
    pub fn contains(&self, id: BufferId) -> bool {
        self.points.contains_key(&id)
    }

    /// Number of tracked points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Host bucket an identity belongs to
    pub fn bucket_of(id: BufferId, buckets: usize) -> usize {
        (id.raw() % buckets.max(1) as u64) as usize
    }

    /// Snapshot of host-resident points in one bucket
    pub fn host_bucket_points(&self, bucket: usize, buckets: usize) -> Vec<Arc<AllocationPoint>> {
        self.points
            .iter()
            .filter(|entry| {
                Self::bucket_of(*entry.key(), buckets) == bucket
                    && entry.value().status() == AllocationStatus::Host
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of device-resident points on one device
    pub fn device_points(&self, device_id: usize) -> Vec<Arc<AllocationPoint>> {
        self.points
            .iter()
            .filter(|entry| {
                entry.value().status() == AllocationStatus::Device
                    && entry.value().device_id() == Some(device_id)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of host-resident points in one bucket
    pub fn host_bucket_count(&self, bucket: usize, buckets: usize) -> usize {
        self.points
            .iter()
            .filter(|entry| {
                Self::bucket_of(*entry.key(), buckets) == bucket
                    && entry.value().status() == AllocationStatus::Host
            })
            .count()
    }

    /// Number of device-resident points on one device
    pub fn device_count(&self, device_id: usize) -> usize {
        self.points
            .iter()
            .filter(|entry| {
                entry.value().status() == AllocationStatus::Device
                    && entry.value().device_id() == Some(device_id)
            })
            .count()
    }

    /// Snapshot of every tracked point
    pub fn all_points(&self) -> Vec<Arc<AllocationPoint>> {
        self.points.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

impl Default for TrackingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrackingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingTable").field("len", &self.len()).finish()
    }
}
