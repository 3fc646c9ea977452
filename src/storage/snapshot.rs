//! Snapshots
//!
//! A snapshot is a sequence number plus a registration in the engine's
//! snapshot registry. Clones share one registration, which is released when
//! the last clone is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Tracks which sequence points are pinned by live snapshots
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    live: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, seq: u64) {
        *self.live.lock().entry(seq).or_insert(0) += 1;
    }

    fn release(&self, seq: u64) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                live.remove(&seq);
            }
        }
    }

    /// Number of live snapshot registrations
    pub fn live_count(&self) -> usize {
        self.live.lock().values().sum()
    }

    /// Oldest pinned sequence number
    pub fn oldest(&self) -> Option<u64> {
        self.live.lock().keys().next().copied()
    }
}

struct Registration {
    seq: u64,
    registry: Arc<SnapshotRegistry>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.seq);
    }
}

/// Immutable read view of storage committed up to `seq`
#[derive(Clone)]
pub struct Snapshot {
    registration: Arc<Registration>,
}

impl Snapshot {
    pub(crate) fn new(seq: u64, registry: Arc<SnapshotRegistry>) -> Self {
        registry.register(seq);
        Self {
            registration: Arc::new(Registration { seq, registry }),
        }
    }

    /// Sequence point of this view
    pub fn seq(&self) -> u64 {
        self.registration.seq
    }

    /// Whether a write committed at `seq` is visible
    pub fn is_visible(&self, seq: u64) -> bool {
        seq <= self.registration.seq
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("seq", &self.seq()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_lifecycle() {
        let registry = Arc::new(SnapshotRegistry::new());
        let a = Snapshot::new(5, registry.clone());
        let b = Snapshot::new(9, registry.clone());
        assert_eq!(registry.live_count(), 2);
        assert_eq!(registry.oldest(), Some(5));

        let a2 = a.clone();
        drop(a);
        assert_eq!(registry.oldest(), Some(5));
        drop(a2);
        assert_eq!(registry.oldest(), Some(9));

        assert!(b.is_visible(9));
        assert!(!b.is_visible(10));
        drop(b);
        assert_eq!(registry.live_count(), 0);
    }
}
