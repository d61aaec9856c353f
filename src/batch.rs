//! Partition math for data-parallel batch tasks.
//!
//! A batch over `count` items is divided into `run_count` sub-ranges of
//! `1 << shift` items each, where
//! `shift = max(ceil_log2(count) - 4, ceil_log2(min_batch), 0)`. The default
//! target is roughly 16 sub-ranges, but a sub-range is never smaller than
//! the caller's `min_batch`.

use core::ops::Range;

/// Subtracted from `ceil_log2(count)` to target ~16 sub-ranges per batch.
const TARGET_SPLIT_LOG2: u32 = 4;

fn ceil_log2(x: u32) -> u32 {
    match x {
        0 | 1 => 0,
        _ => 32 - (x - 1).leading_zeros(),
    }
}

/// Shift such that `1 << shift` is the sub-range length for a batch of
/// `count` items with minimum batch size `min_batch`.
pub fn batch_shift(count: u32, min_batch: u32) -> u32 {
    ceil_log2(count)
        .saturating_sub(TARGET_SPLIT_LOG2)
        .max(ceil_log2(min_batch))
}

/// Number of sub-ranges a batch of `count` items is divided into.
pub fn batch_run_count(count: u32, shift: u32) -> u32 {
    debug_assert!(shift < 32, "batch_run_count: shift out of range");
    count.div_ceil(1 << shift)
}

/// The `run`-th sub-range of the batch starting at `begin` with `count`
/// items, for the given `shift`.
pub fn batch_sub_range(begin: u32, count: u32, shift: u32, run: u32) -> Range<u32> {
    let chunk = 1u32 << shift;
    let lo = begin + (run << shift);
    let hi = lo.saturating_add(chunk).min(begin + count);
    lo..hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousand_items_min_batch_32() {
        let shift = batch_shift(1000, 32);
        // ceil_log2(1000) = 10, 10 - 4 = 6 beats ceil_log2(32) = 5.
        assert_eq!(shift, 6);
        assert_eq!(batch_run_count(1000, shift), 16);
        assert_eq!(batch_sub_range(0, 1000, shift, 0), 0..64);
        assert_eq!(batch_sub_range(0, 1000, shift, 15), 960..1000);
    }

    #[test]
    fn min_batch_dominates_small_counts() {
        let shift = batch_shift(100, 64);
        assert_eq!(shift, 6);
        assert_eq!(batch_run_count(100, shift), 2);
        assert_eq!(batch_sub_range(10, 100, shift, 1), 74..110);
    }

    #[test]
    fn single_item() {
        let shift = batch_shift(1, 1);
        assert_eq!(shift, 0);
        assert_eq!(batch_run_count(1, shift), 1);
        assert_eq!(batch_sub_range(7, 1, shift, 0), 7..8);
    }

    #[test]
    fn sub_ranges_tile_exactly() {
        for &(count, min_batch) in &[(1000, 32), (17, 1), (4096, 256), (3, 16)] {
            let shift = batch_shift(count, min_batch);
            let runs = batch_run_count(count, shift);
            let mut next = 5;
            for run in 0..runs {
                let range = batch_sub_range(5, count, shift, run);
                assert_eq!(range.start, next);
                assert!(range.end > range.start);
                next = range.end;
            }
            assert_eq!(next, 5 + count);
        }
    }
}
