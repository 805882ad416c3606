/*!
 * Writer Pool
 * Supervised batch consumers draining staging shards into the store
 */

mod pool;
mod worker;

pub use pool::{PoolSnapshot, WriterPool, WriterPoolStats};
pub(crate) use worker::WriterContext;
