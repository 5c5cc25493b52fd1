//! Variable identifier allocation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::data::VarId;

/// Allocator for stable variable identifiers.
///
/// Each id combines a monotonic counter with a fresh 62-bit random
/// component, so concurrent callers in one process never collide and
/// independent processes assigning ids to disjoint config fragments
/// collide with negligible probability.
///
/// On startup the counter is restored from the maximum persisted id, which
/// keeps newly assigned ids strictly above everything already in the
/// config file.
pub struct IdAllocator {
    counter: AtomicI64,
    rng: Mutex<StdRng>,
}

impl IdAllocator {
    /// Create an allocator with the counter at zero.
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Raise the counter to `max` so that future ids exceed all persisted
    /// ones. Never lowers the counter.
    pub fn restore_high_watermark(&self, max: VarId) {
        self.counter.fetch_max(max, Ordering::SeqCst);
    }

    /// Allocate the next identifier.
    ///
    /// Strictly positive, unique within the process lifetime, and unique
    /// across restarts when the watermark was restored first.
    pub fn next(&self) -> VarId {
        let random: i64 = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            rng.gen_range(1..=1_i64 << 62)
        };
        random + self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current counter value (diagnostics and tests).
    pub fn counter(&self) -> i64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_positive_and_unique() {
        let alloc = IdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = alloc.next();
            assert!(id > 0);
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }

    #[test]
    fn test_watermark_restoration() {
        let alloc = IdAllocator::new();
        alloc.restore_high_watermark(5000);
        assert_eq!(alloc.counter(), 5000);

        // Restoring a lower watermark must not rewind the counter.
        alloc.restore_high_watermark(100);
        assert_eq!(alloc.counter(), 5000);

        let id = alloc.next();
        assert!(id > 5000);
    }

    #[test]
    fn test_concurrent_next_never_collides() {
        let alloc = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| alloc.next()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
