use std::sync::atomic::{AtomicI64, Ordering};

use once_cell::sync::Lazy;

/// Monotonic 64-bit key sequence
///
/// Keys are only unique within one sequence. The process-wide sequence is
/// seeded from a random non-negative 32-bit value so that keys from two runs
/// of the same process rarely overlap.
#[derive(Debug)]
pub struct KeySequence {
    current: AtomicI64,
}

impl KeySequence {
    /// Create a sequence whose first key is `seed + 1`
    pub fn starting_at(seed: i64) -> Self {
        Self {
            current: AtomicI64::new(seed),
        }
    }

    /// Create a randomly seeded sequence
    pub fn seeded() -> Self {
        Self::starting_at(i64::from(rand::random::<u32>() >> 1))
    }

    /// Return the next key
    pub fn next(&self) -> i64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }
}

static PROCESS_KEYS: Lazy<KeySequence> = Lazy::new(KeySequence::seeded);

/// Next key from the process-wide sequence
pub fn next_unique_key() -> i64 {
    PROCESS_KEYS.next()
}
