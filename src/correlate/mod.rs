/*!
 * Correlation Engine
 * Reconstructs causal relationships across events from many processes
 */

mod engine;
mod state;

pub use engine::{CorrelationStats, Correlator};
pub use state::{CallFrame, CorrelationKind, CorrelationMeta, MessageSignature, Pending};
