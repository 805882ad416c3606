/*!
 * Query Options
 * Limit, ordering, and time-range options shared by all query paths
 */

use crate::core::types::MonoNs;
use serde::{Deserialize, Serialize};

/// Result ordering by monotonic timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Half-open monotonic time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: MonoNs,
    pub end: MonoNs,
}

impl TimeRange {
    #[inline]
    pub fn new(start: MonoNs, end: MonoNs) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    #[inline]
    pub fn all() -> Self {
        Self {
            start: 0,
            end: MonoNs::MAX,
        }
    }

    #[inline]
    pub fn contains(&self, ts: MonoNs) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Options accepted by every query entry point
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub order: Order,
    /// Extra time filter applied on top of the index being queried
    pub range: Option<TimeRange>,
}

impl QueryOptions {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[inline]
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[inline]
    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }
}
