//! Seeded operation-stream generator.
//!
//! Produces a uniform random mix of adds and queries: indices uniform
//! over `[0, size)`, add values uniform over `[1, 100]`, and a query
//! probability expressed in permille so the sweep strategies can dial
//! anywhere from an update-only stream to query-only.

use parbit::Operation;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Default RNG seed for reproducible runs.
pub const DEFAULT_SEED: u64 = 15618;

/// Deterministic generator of operation batches.
pub struct Generator {
    rng: SmallRng,
    size: usize,
    query_permille: u32,
}

impl Generator {
    /// Creates a generator over tree indices `[0, size)`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `query_permille` exceeds 1000.
    #[must_use]
    pub fn new(size: usize, query_permille: u32, seed: u64) -> Self {
        assert!(size > 0, "tree size must be at least 1");
        assert!(query_permille <= 1000, "query permille must be <= 1000");
        Self {
            rng: SmallRng::seed_from_u64(seed),
            size,
            query_permille,
        }
    }

    /// Draws the next operation.
    pub fn next_op(&mut self) -> Operation {
        let roll = self.rng.gen_range(1..=1000_u32);
        let index = self.rng.gen_range(0..self.size);
        if roll <= self.query_permille {
            Operation::query(index)
        } else {
            Operation::add(index, self.rng.gen_range(1..=100_i64))
        }
    }

    /// Refills `buf` with `len` fresh operations.
    pub fn fill(&mut self, buf: &mut Vec<Operation>, len: usize) {
        buf.clear();
        buf.extend((0..len).map(|_| self.next_op()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parbit::OpKind;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Generator::new(1024, 200, 42);
        let mut b = Generator::new(1024, 200, 42);
        for _ in 0..1000 {
            let (x, y) = (a.next_op(), b.next_op());
            assert_eq!(x.kind, y.kind);
            assert_eq!(x.index, y.index);
            assert_eq!(x.value, y.value);
        }
    }

    #[test]
    fn indices_and_values_in_range() {
        let mut generator = Generator::new(100, 500, 7);
        for _ in 0..10_000 {
            let op = generator.next_op();
            assert!(op.index < 100);
            if op.kind == OpKind::Add {
                assert!((1..=100).contains(&op.value));
            }
        }
    }

    #[test]
    fn permille_zero_yields_no_queries() {
        let mut generator = Generator::new(64, 0, 1);
        for _ in 0..5000 {
            assert_eq!(generator.next_op().kind, OpKind::Add);
        }
    }

    #[test]
    fn permille_thousand_yields_only_queries() {
        let mut generator = Generator::new(64, 1000, 1);
        for _ in 0..5000 {
            assert_eq!(generator.next_op().kind, OpKind::Query);
        }
    }

    #[test]
    fn mix_ratio_is_roughly_respected() {
        let mut generator = Generator::new(64, 200, 3);
        let queries = (0..100_000)
            .filter(|_| generator.next_op().kind == OpKind::Query)
            .count();
        // 20% +- 2% over 100k draws
        assert!((18_000..=22_000).contains(&queries), "queries = {queries}");
    }

    #[test]
    fn fill_replaces_buffer_contents() {
        let mut generator = Generator::new(64, 200, 9);
        let mut buf = Vec::new();
        generator.fill(&mut buf, 128);
        assert_eq!(buf.len(), 128);
        generator.fill(&mut buf, 64);
        assert_eq!(buf.len(), 64);
    }
}
