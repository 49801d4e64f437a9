//! Per-destination admission control.
//!
//! Each destination key (the dialed IP, or the hostname when the name is
//! passed through) has an in-flight tunnel counter. Admission increments and
//! compares in a single step under the store's lock, so two concurrent
//! requests can never both take the last slot.
//!
//! An admitted request holds an [`AdmissionPermit`]. The permit releases its
//! slot exactly once, when it is dropped, whichever way the session ends.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Counter storage behind the admission controller.
///
/// The in-process [`MemoryAdmissionStore`] is the default; a shared store can
/// be substituted without touching the pipeline.
pub trait AdmissionStore: Send + Sync {
    /// Increment `key` and compare against `ceiling` as one step.
    ///
    /// Returns the post-increment count when admitted. When the count would
    /// exceed `ceiling` the increment is rolled back and `None` is returned.
    fn try_acquire(&self, key: &str, ceiling: usize) -> Option<usize>;

    /// Decrement `key`, never below zero.
    fn release(&self, key: &str);

    /// Current in-flight count for `key`.
    fn in_flight(&self, key: &str) -> usize;
}

/// Process-local [`AdmissionStore`].
///
/// Entries are removed when their count returns to zero, so the table only
/// holds currently active destinations.
#[derive(Debug, Default)]
pub struct MemoryAdmissionStore {
    counts: Mutex<HashMap<String, usize>>,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of destinations with at least one tunnel in flight.
    pub fn active_destinations(&self) -> usize {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        self.counts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl AdmissionStore for MemoryAdmissionStore {
    fn try_acquire(&self, key: &str, ceiling: usize) -> Option<usize> {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count <= ceiling {
            return Some(*count);
        }
        *count -= 1;
        if *count == 0 {
            counts.remove(key);
        }
        None
    }

    fn release(&self, key: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(key);
            }
        }
    }

    fn in_flight(&self, key: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Admits tunnels against a per-destination ceiling.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn AdmissionStore>,
    ceiling: usize,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn AdmissionStore>, ceiling: usize) -> Self {
        Self { store, ceiling }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Try to take a slot for `key`.
    ///
    /// A rejected attempt holds nothing.
    pub fn try_admit(&self, key: &str) -> Option<AdmissionPermit> {
        let count = self.store.try_acquire(key, self.ceiling)?;
        Some(AdmissionPermit {
            key: key.to_string(),
            count,
            store: Arc::clone(&self.store),
            released: false,
        })
    }

    /// Current in-flight count for `key`.
    pub fn in_flight(&self, key: &str) -> usize {
        self.store.in_flight(key)
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("ceiling", &self.ceiling)
            .finish_non_exhaustive()
    }
}

/// One admitted tunnel's claim on its destination slot.
pub struct AdmissionPermit {
    key: String,
    count: usize,
    store: Arc<dyn AdmissionStore>,
    released: bool,
}

impl AdmissionPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// In-flight count for the key right after this permit was granted.
    pub fn count_at_admission(&self) -> usize {
        self.count
    }

    /// Give the slot back now rather than at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.store.release(&self.key);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("key", &self.key)
            .field("count", &self.count)
            .field("released", &self.released)
            .finish()
    }
}
