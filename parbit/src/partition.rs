//! Load-balanced index partitions for the model-parallel engines.
//!
//! A partition splits the 1-indexed backing array `[1, n+1)` into one
//! half-open interval per worker. Balancing uniformly by index width
//! would be badly skewed: the Fenwick update chain touches low
//! `lowbit` indices on almost every `add` and high ones almost never.
//! The access-aware planner therefore weights each index by the number
//! of update chains that pass through it, so every worker performs
//! roughly the same number of array writes per batch.

use crate::tree::lowbit;

/// Number of `i64` cells per cache line boundary used by the alignment
/// pass. Interior partition boundaries are rounded up to a multiple of
/// this so two workers never write the same line.
pub const CACHE_LINE_CELLS: usize = 64;

/// A worker's half-open interval `[lower, upper)` of backing-array
/// indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// First index owned by the worker.
    pub lower: usize,
    /// One past the last index owned by the worker.
    pub upper: usize,
}

impl Range {
    /// True when the worker owns no indices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    /// Number of indices owned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.upper.saturating_sub(self.lower)
    }
}

/// Computes the update-path access count for every index in `[1, n]`.
///
/// `dp[i]` is the number of indices `k` in `[0, n)` whose `add(k, _)`
/// chain visits `i`. The forward recurrence mirrors the chain itself:
/// each index contributes its own count to its chain successor.
#[must_use]
pub fn access_weights(n: usize) -> Vec<u64> {
    let mut dp = vec![0_u64; n + 1];
    for x in 1..=n {
        dp[x] += 1;
        let next = x + lowbit(x);
        if next <= n {
            dp[next] += dp[x];
        }
    }
    dp
}

/// Plans `workers` intervals tiling `[1, n+1)` weighted by update-path
/// access counts.
///
/// Each worker's target is `remaining_total / (workers - w)`, so
/// rounding error from earlier workers is absorbed by the later ones
/// rather than piling onto the last. A one-step-back pass fixes the
/// overshoot when dropping the final index lands closer to the target.
/// Workers beyond `n` receive empty trailing intervals.
///
/// # Panics
///
/// Panics if `workers` is zero.
#[must_use]
pub fn plan_access_aware(n: usize, workers: usize) -> Vec<Range> {
    assert!(workers > 0, "partition needs at least one worker");
    let dp = access_weights(n);
    let mut remaining: u64 = dp.iter().sum();
    let mut ranges = Vec::with_capacity(workers);
    let mut cur = 1_usize;

    for w in 0..workers {
        let lower = cur;
        if w + 1 == workers {
            // The last worker takes whatever is left.
            ranges.push(Range { lower, upper: n + 1 });
            break;
        }

        // Ceiling division: a floor target of zero would make small
        // trees pile onto the last worker instead of the first.
        let target = remaining.div_ceil((workers - w) as u64);
        let mut taken = 0_u64;
        while cur <= n && taken < target {
            taken += dp[cur];
            cur += 1;
        }

        if cur > lower {
            let last = dp[cur - 1];
            if (taken - last).abs_diff(target) < taken.abs_diff(target) {
                cur -= 1;
                taken -= last;
            }
        }

        ranges.push(Range { lower, upper: cur });
        remaining -= taken;
    }

    ranges
}

/// Plans `workers` intervals of equal index width over `[1, n+1)`.
///
/// This is the naive baseline the access-aware planner is measured
/// against: low-index workers end up doing most of the writes.
///
/// # Panics
///
/// Panics if `workers` is zero.
#[must_use]
pub fn plan_uniform(n: usize, workers: usize) -> Vec<Range> {
    assert!(workers > 0, "partition needs at least one worker");
    (0..workers)
        .map(|w| Range {
            lower: 1 + n * w / workers,
            upper: 1 + n * (w + 1) / workers,
        })
        .collect()
}

/// Rounds interior boundaries up to the next multiple of
/// [`CACHE_LINE_CELLS`], preserving coverage of `[1, n+1)`.
///
/// The last worker keeps the remainder, so its interval is the only
/// one allowed to end off a cache-line boundary.
pub fn align_to_cache_lines(ranges: &mut [Range], n: usize) {
    let count = ranges.len();
    let mut cur = ranges.first().map_or(1, |r| r.lower);
    for (w, range) in ranges.iter_mut().enumerate() {
        range.lower = cur;
        let mut upper = range.upper.max(cur);
        if w + 1 < count {
            while upper < n + 1 && upper % CACHE_LINE_CELLS != 0 {
                upper += 1;
            }
        } else {
            upper = n + 1;
        }
        range.upper = upper;
        cur = upper;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: the planner tiles [1, n+1) for any worker count.
        #[test]
        fn planner_always_covers(n in 1..4096_usize, workers in 1..32_usize) {
            let ranges = plan_access_aware(n, workers);
            prop_assert_eq!(ranges.len(), workers);
            prop_assert_eq!(ranges[0].lower, 1);
            prop_assert_eq!(ranges.last().unwrap().upper, n + 1);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].upper, pair[1].lower);
            }
        }

        /// Property: alignment keeps the tiling intact.
        #[test]
        fn alignment_always_covers(n in 1..4096_usize, workers in 1..32_usize) {
            let mut ranges = plan_access_aware(n, workers);
            align_to_cache_lines(&mut ranges, n);
            prop_assert_eq!(ranges[0].lower, 1);
            prop_assert_eq!(ranges.last().unwrap().upper, n + 1);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].upper, pair[1].lower);
            }
        }

        /// Property: total weight is conserved across the partition.
        #[test]
        fn weights_are_conserved(n in 1..2048_usize, workers in 1..16_usize) {
            let dp = access_weights(n);
            let total: u64 = dp.iter().sum();
            let ranges = plan_access_aware(n, workers);
            let sum: u64 = ranges
                .iter()
                .map(|r| (r.lower..r.upper).map(|i| dp[i]).sum::<u64>())
                .sum();
            prop_assert_eq!(total, sum);
        }
    }
}
