/*!
 * Core Types
 * Common types used across the pipeline
 */

/// Originating-process identity of a traced unit of work
///
/// 64-bit because traced "processes" are logical actors (OS processes, green
/// threads, remote workers), not host PIDs.
pub type Pid = u64;

/// Monotonic timestamp in nanoseconds
///
/// The epoch is whatever monotonic clock the instrumentation layer samples;
/// only differences between values are meaningful.
pub type MonoNs = u64;

/// Wall-clock timestamp in nanoseconds since the Unix epoch
pub type WallNs = u64;
