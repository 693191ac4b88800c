//! Injected id generation
//!
//! Node, message and transfer ids are random 64-bit values. The source is
//! injected so tests can supply a deterministic sequence instead of a
//! process-global RNG.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of non-zero 64-bit ids.
pub trait IdSource: Send + Sync + 'static {
    /// Produce the next id. Never returns zero.
    fn next_id(&self) -> u64;
}

/// Production id source backed by an OS-seeded RNG.
pub struct RandomIds {
    rng: Mutex<StdRng>,
}

impl RandomIds {
    /// Create a freshly seeded source.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn next_id(&self) -> u64 {
        let mut rng = self.rng.lock().unwrap();
        loop {
            let id: u64 = rng.gen();
            if id != 0 {
                return id;
            }
        }
    }
}

/// Deterministic source for tests: counts up from a starting value.
pub struct SequenceIds {
    next: AtomicU64,
}

impl SequenceIds {
    /// Create a source yielding `start`, `start + 1`, …
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }
}

impl IdSource for SequenceIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_nonzero_and_distinct() {
        let ids = RandomIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn sequence_ids_count_up() {
        let ids = SequenceIds::starting_at(5);
        assert_eq!(ids.next_id(), 5);
        assert_eq!(ids.next_id(), 6);
    }

    #[test]
    fn sequence_never_starts_at_zero() {
        let ids = SequenceIds::starting_at(0);
        assert_eq!(ids.next_id(), 1);
    }
}
