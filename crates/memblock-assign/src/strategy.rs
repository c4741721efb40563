//! Block-size range strategies.
//!
//! With ranges enabled, every request is rounded up to the smallest range
//! that holds it, so blocks come in a few sizes and are easier to reuse.
//! The strategy decides what the ranges are.

use std::fmt;

use crate::utils::align_mem_offset;

/// How block-size ranges are derived from the requested sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RangeStrategy {
    /// Power-of-two buckets, merged down to the configured count.
    Binary,
    /// A single range equal to the largest request.
    Max,
    /// Run both and keep whichever needs less memory.
    Hybrid,
}

impl RangeStrategy {
    /// Concrete strategies to run, in tie-break order.
    pub fn variants(self) -> &'static [RangeStrategy] {
        match self {
            Self::Binary => &[Self::Binary],
            Self::Max => &[Self::Max],
            Self::Hybrid => &[Self::Binary, Self::Max],
        }
    }

    /// Whether the lifetime-gap nesting pass pays off for this strategy.
    ///
    /// Uniform `Max` blocks are interchangeable, so pool reuse already
    /// captures what nesting would.
    pub fn need_level2_reuse(self) -> bool {
        !matches!(self, Self::Max)
    }

    /// Ranges for a set of requested sizes, ascending.
    ///
    /// Sizes are aligned first and zero sizes are ignored. `Hybrid` yields
    /// the `Binary` ranges.
    pub fn memory_ranges(self, sizes: &[u64], max_range_count: usize) -> Vec<u64> {
        let mut sizes: Vec<u64> = sizes
            .iter()
            .copied()
            .filter(|&s| s > 0)
            .map(align_mem_offset)
            .collect();
        sizes.sort_unstable();
        sizes.dedup();
        let Some(&max) = sizes.last() else {
            return Vec::new();
        };
        match self {
            Self::Max => vec![max],
            Self::Binary | Self::Hybrid => binary_ranges(&sizes, max_range_count.max(1)),
        }
    }
}

impl fmt::Display for RangeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Max => write!(f, "max"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Bucket sorted, deduplicated sizes by `floor(log2)`, each bucket's range
/// being its largest member, then merge the closest neighbours until at
/// most `max_count` remain.
fn binary_ranges(sorted: &[u64], max_count: usize) -> Vec<u64> {
    let mut buckets: Vec<(u32, u64)> = Vec::new();
    for &s in sorted {
        let exp = u64::BITS - 1 - s.leading_zeros();
        match buckets.last_mut() {
            Some((e, top)) if *e == exp => *top = s,
            _ => buckets.push((exp, s)),
        }
    }
    let mut ranges: Vec<u64> = buckets.into_iter().map(|(_, top)| top).collect();
    while ranges.len() > max_count {
        // Merging drops the smaller range of the pair with the least growth.
        let pos = (0..ranges.len() - 1)
            .min_by(|&a, &b| {
                let ga = ranges[a + 1] as u128 * ranges[b] as u128;
                let gb = ranges[b + 1] as u128 * ranges[a] as u128;
                ga.cmp(&gb)
            })
            .unwrap_or(0);
        ranges.remove(pos);
    }
    ranges
}

/// Size a request is rounded up to: the smallest range holding it.
///
/// Requests above every range keep their own size.
pub fn block_size_for(size: u64, ranges: &[u64]) -> u64 {
    ranges
        .iter()
        .copied()
        .find(|&r| r >= size)
        .unwrap_or(size)
}
