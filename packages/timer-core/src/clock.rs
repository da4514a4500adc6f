//! Monotonic clock access shared by SYNC and DET.
//!
//! Backed by [`std::time::Instant`], which the standard library guarantees
//! never moves backwards and is immune to wall-clock adjustments — exactly
//! the contract SYNC's sample collection depends on.

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since an arbitrary, process-local epoch. Never decreases,
/// never jumps. Resolution is whatever the platform's `Instant` provides,
/// which on every tier-1 target is sub-microsecond.
pub fn now_nanos() -> i64 {
    let start = PROCESS_START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_decreases() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }
}
