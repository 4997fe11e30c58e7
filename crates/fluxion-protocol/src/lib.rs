//! Message types exchanged between the dispatcher and handler workers.
//!
//! Every command carries a correlation id allocated by the dispatcher; every
//! result echoes it back. Memory samples are unsolicited and carry no id, so
//! receivers must route on message type before looking at ids.

pub mod error;
pub mod messages;

pub use error::{WorkerError, WorkerErrorCode};
pub use messages::{
    ExecutePayload, ExecuteReply, HandlerMeta, HandlerResponse, InspectPayload, MemorySample,
    WorkerCommand, WorkerEvent,
};

/// Correlation id for a dispatched command.
pub type CorrelationId = u64;
