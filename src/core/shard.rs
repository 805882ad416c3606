/*!
 * Shard Count Planning
 *
 * CPU-topology-aware shard count calculation for the keyed correlation and
 * store maps. Instead of hardcoded values, shard counts are computed once from
 * the host's available parallelism, so the same binary scales from small CI
 * runners to large servers.
 *
 * Design Rationale:
 * - Power-of-2 shards enable fast modulo via bitwise AND
 * - CPU-proportional scaling: more cores = more beneficial parallelism
 * - One-time computation: zero runtime overhead after initialization
 */

use crate::core::limits::{MAX_STATE_SHARDS, MIN_STATE_SHARDS};
use std::sync::OnceLock;

static SHARD_PLAN: OnceLock<ShardPlan> = OnceLock::new();

/// Hardware-aware shard count calculator
#[derive(Debug, Clone)]
pub struct ShardPlan {
    cpu_count: usize,
}

impl ShardPlan {
    fn instance() -> &'static Self {
        SHARD_PLAN.get_or_init(|| {
            let cpu_count = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or_else(|_| {
                    tracing::warn!("failed to detect CPU count, defaulting to 8");
                    8
                });
            Self { cpu_count }
        })
    }

    /// Calculate the shard count for a given access profile
    pub fn shards(profile: WorkloadProfile) -> usize {
        let base = Self::instance().cpu_count;

        let multiplier = match profile {
            // Per-process call stacks and pending messages: every Writer
            // batch touches many keys concurrently
            WorkloadProfile::HighContention => 4,

            // Correlation metadata and store indexes: written per batch,
            // read by queries and sweeps
            WorkloadProfile::MediumContention => 2,

            // Hint bindings and other rarely-touched maps
            WorkloadProfile::LowContention => 1,
        };

        // Power of 2 for bitmask distribution, clamped so 1-2 core systems
        // do not degenerate and 128-core systems do not waste memory
        (base * multiplier)
            .next_power_of_two()
            .clamp(MIN_STATE_SHARDS, MAX_STATE_SHARDS)
    }

    /// CPU count detected at initialization
    pub fn cpu_count() -> usize {
        Self::instance().cpu_count
    }
}

/// Workload characterization for shard count calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadProfile {
    /// Heavy concurrent access (call stacks, pending messages)
    HighContention,

    /// Moderate concurrent access (correlation metadata, store indexes)
    MediumContention,

    /// Light concurrent access (hint bindings)
    LowContention,
}
