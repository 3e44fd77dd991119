//! linewire: line-delimited JSON IPC engine for worker processes.
//!
//! A worker reads one JSON request per line from its input stream, dispatches
//! each to a registered handler, and replies with correlated envelopes
//! (response/progress/event/error), one JSON object per line on the output
//! stream. Requests overlap freely; replies for one request keep their
//! emission order and every valid request gets exactly one terminal reply.

pub mod codec;
mod dispatch;
mod emitter;
mod log_layer;
pub mod protocol;
pub mod registry;
pub mod worker;

pub use codec::{JsonLinesCodec, MalformedMessage, decode_request};
pub use emitter::RequestContext;
pub use log_layer::IpcLogLayer;
pub use protocol::{
    Envelope, ErrorBody, ErrorCode, LogLevel, LogRecord, ProgressUpdate, Request, topic,
};
pub use registry::{Handler, HandlerRegistry, UnknownMethod};
pub use worker::{Worker, WorkerConfig};
