//! Assignment configuration parameters.

use crate::block::MAX_DEPTH_NUM;
use crate::error::AssignError;
use crate::strategy::RangeStrategy;

/// Policy knobs for the reuse search.
///
/// An immutable value; copied into every assignment run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReuseStrategy {
    /// Round requests up to the strategy's block-size ranges.
    ///
    /// With ranges, a block can only be reused by requests that fit its
    /// current size. Without ranges, any released block may be reused and
    /// grows to the largest request it hosts.
    pub use_range: bool,
    /// Prefer the smallest fitting block over pool order.
    pub ascending_sort: bool,
    /// Search the pool from the earliest released block (FIFO) instead of
    /// the most recently released one (LIFO).
    pub reuse_first_release: bool,
    /// Trade cross-stream synchronisation for footprint: blocks whose only
    /// other-stream consumers form a chain that returns to the origin stream
    /// stay reusable, with their release deferred to the returning node.
    pub memory_priority_mode: bool,
}

impl ReuseStrategy {
    /// Ranges on, best fit, last-release-first, no cross-stream priority.
    pub const DEFAULT: Self = Self {
        use_range: true,
        ascending_sort: true,
        reuse_first_release: false,
        memory_priority_mode: false,
    };
}

impl Default for ReuseStrategy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Configuration for [`BlockMemAssigner`](crate::BlockMemAssigner).
///
/// Validated at assigner construction; immutable afterwards.
#[derive(Clone, Debug)]
pub struct AssignConfig {
    /// Block-size range strategy.
    ///
    /// Default: [`RangeStrategy::Hybrid`], which runs both concrete
    /// strategies and keeps the smaller result.
    pub strategy: RangeStrategy,

    /// Reuse search policy.
    pub reuse: ReuseStrategy,

    /// Atomic outputs are cleaned by their own clean op instead of one
    /// centralized clean. Disables the `ConcentrateAtomic` attribute and
    /// relaxes continuous-memory policies.
    pub separate_atomic_clean: bool,

    /// Outputs feeding the net-output get dedicated, never-reused blocks.
    pub zero_copy_net_output: bool,

    /// Move the intermediate nodes of a returning cross-stream chain onto
    /// the origin stream when they have no other cross-stream dependency.
    pub optimize_diff_stream: bool,

    /// Run the lifetime-gap nesting pass after the main assignment.
    pub level2_reuse: bool,

    /// Depth bound of the nested reuse search.
    ///
    /// Default: [`MAX_DEPTH_NUM`]. Must be in `1..=MAX_DEPTH_NUM`.
    pub max_reuse_depth: usize,

    /// Longest cross-stream chain considered by the diff-stream heuristics.
    pub max_diff_stream_chain: usize,

    /// Upper bound on the number of block-size ranges.
    pub max_range_count: usize,
}

impl AssignConfig {
    /// Default longest diff-stream chain.
    pub const DEFAULT_MAX_DIFF_STREAM_CHAIN: usize = 16;

    /// Default range count bound.
    pub const DEFAULT_MAX_RANGE_COUNT: usize = 8;

    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            strategy: RangeStrategy::Hybrid,
            reuse: ReuseStrategy::DEFAULT,
            separate_atomic_clean: false,
            zero_copy_net_output: true,
            optimize_diff_stream: false,
            level2_reuse: true,
            max_reuse_depth: MAX_DEPTH_NUM,
            max_diff_stream_chain: Self::DEFAULT_MAX_DIFF_STREAM_CHAIN,
            max_range_count: Self::DEFAULT_MAX_RANGE_COUNT,
        }
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), AssignError> {
        if self.max_reuse_depth == 0 || self.max_reuse_depth > MAX_DEPTH_NUM {
            return Err(AssignError::InvalidConfig {
                reason: format!(
                    "max_reuse_depth must be in 1..={MAX_DEPTH_NUM}, got {}",
                    self.max_reuse_depth
                ),
            });
        }
        if self.max_range_count == 0 {
            return Err(AssignError::InvalidConfig {
                reason: "max_range_count must be at least 1".to_string(),
            });
        }
        if self.max_diff_stream_chain == 0 {
            return Err(AssignError::InvalidConfig {
                reason: "max_diff_stream_chain must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for AssignConfig {
    fn default() -> Self {
        Self::new()
    }
}
