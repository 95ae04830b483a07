//! Access rings - temperature tracking
//!
//! A ring records an access-event count per reclamation scan interval in a
//! fixed-size circular buffer. Its running average is the "temperature" a
//! memory class is running at; reclamation thresholds are derived from it.
//! Recording is O(1) and lock-scoped to the ring alone.

use parking_lot::Mutex;

/// Default ring capacity: 30 retained scan intervals
pub const DEFAULT_RING_CAPACITY: usize = 30;

struct RingInner {
    samples: Vec<u32>,
    position: usize,
    filled: usize,
    current: u32,
}

/// Fixed-capacity circular buffer of per-interval access counts
///
/// # Example
/// ```
/// use jitmem::AccessRing;
///
/// let ring = AccessRing::new(4);
/// ring.record();
/// ring.record();
/// ring.roll();
/// assert_eq!(ring.average(), 2.0);
/// ```
pub struct AccessRing {
    inner: Mutex<RingInner>,
}

impl AccessRing {
    /// Create a ring retaining `capacity` intervals
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            inner: Mutex::new(RingInner {
                samples: vec![0; capacity],
                position: 0,
                filled: 0,
                current: 0,
            }),
        }
    }

    /// Record one access event in the current interval
    pub fn record(&self) {
        let mut inner = self.inner.lock();
        inner.current = inner.current.saturating_add(1);
    }

    /// Close the current interval and start a new one
    pub fn roll(&self) {
        let mut inner = self.inner.lock();
        let position = inner.position;
        let current = inner.current;
        inner.samples[position] = current;
        inner.position = (position + 1) % inner.samples.len();
        inner.filled = (inner.filled + 1).min(inner.samples.len());
        inner.current = 0;
    }

    /// Mean event count over retained intervals
    ///
    /// Returns 0.0 until at least one interval has been rolled.
    pub fn average(&self) -> f32 {
        let inner = self.inner.lock();
        if inner.filled == 0 {
            return 0.0;
        }
        let sum: u64 = inner.samples[..inner.filled].iter().map(|&s| u64::from(s)).sum();
        sum as f32 / inner.filled as f32
    }

    /// Event count of the interval currently being recorded
    pub fn current(&self) -> u32 {
        self.inner.lock().current
    }
}

impl Default for AccessRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl std::fmt::Debug for AccessRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessRing")
            .field("average", &self.average())
            .field("current", &self.current())
            .finish()
    }
}
