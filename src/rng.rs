//! Cheap per-thread randomness, used by the skip-list engines to pick
//! a new node's level with geometric drop-off 1/2.
//!
//! Each thread gets its own `SmallRng` (a fast, non-cryptographic PRNG)
//! rather than locking a shared generator, so that level choice never
//! becomes a hot spot of its own.

use std::cell::RefCell;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

thread_local! {
    static THREAD_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Re-seed the calling thread's generator. Used by the benchmark
/// harness so that `-S seed` produces reproducible workloads per
/// thread (each thread's generator is seeded from `seed` mixed with a
/// thread-local salt, so distinct threads don't draw identical
/// sequences).
pub fn seed_thread(seed: u64, thread_index: u64) {
    THREAD_RNG.with(|rng| {
        *rng.borrow_mut() = SmallRng::seed_from_u64(seed ^ (thread_index.wrapping_mul(0x9E3779B97F4A7C15)));
    });
}

/// Draw a uniform key in `[low, high)`.
pub fn next_key(low: i32, high: i32) -> i32 {
    THREAD_RNG.with(|rng| rng.borrow_mut().gen_range(low..high))
}

/// Draw a uniform percentage in `[0, 100)`, for deciding whether an
/// operation is an update vs. a read.
pub fn next_percent() -> u32 {
    THREAD_RNG.with(|rng| rng.borrow_mut().gen_range(0..100))
}

/// Choose a random skip-list level in `[1, max_levels]` with
/// P(level >= l) = 2^-(l-1): flip a coin per level and stop at the
/// first tails, clamped to `max_levels`.
pub fn random_level(max_levels: usize) -> usize {
    THREAD_RNG.with(|rng| {
        let mut level = 1;
        let mut rng = rng.borrow_mut();
        while level < max_levels && rng.gen::<bool>() {
            level += 1;
        }
        level
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_level_respects_bound() {
        for _ in 0..1000 {
            let lvl = random_level(12);
            assert!((1..=12).contains(&lvl));
        }
    }

    #[test]
    fn level_distribution_roughly_geometric() {
        let max = 16;
        let trials = 50_000;
        let mut counts = vec![0usize; max + 1];
        for _ in 0..trials {
            counts[random_level(max)] += 1;
        }
        // level 1 should be roughly half of all draws
        let frac = counts[1] as f64 / trials as f64;
        assert!(frac > 0.4 && frac < 0.6, "frac = {frac}");
    }
}
