//! Fan-in of producer event streams into one globally interned client
//! stream.

pub mod collector;
pub mod events;
mod processor;

pub use collector::{ClientCaptureEventCollector, VecCollector};
pub use processor::{ProducerEventProcessor, ProducerProtocolError};

/// Producer id used by the built-in kernel-tracing pipeline. External
/// producers (instrumentation agents, memory samplers, API annotation
/// layers) use their own ids.
pub const KERNEL_TRACING_PRODUCER_ID: u64 = 1;
