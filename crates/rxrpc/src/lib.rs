//! # RxRPC
//!
//! The wire layer of the reactive guest/host invocation protocol.
//!
//! ## Architecture
//!
//! Every exchange between guest and host is a sequence of frames addressed by a
//! `StreamId`. An exchange starts with an `Open` frame naming the operation,
//! carries values as `Next` frames, grants credit with `RequestN` and ends with
//! exactly one of `Complete`, `Error` or `Cancel` per direction.
//!
//! This crate knows nothing about tasks, runtimes or handlers. It moves frames
//! to and from bytes, classifies failures, and provides a small scalar codec
//! (`Wire`) for typed registration. The async machinery lives in `rxrun`.

pub mod codec;
mod error;
mod frame;
mod value;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use error::ErrorKind;
pub use error::FrameError;
pub use error::Result;
pub use frame::Frame;
pub use frame::FrameKind;
pub use frame::MAX_OPERATION_NAME;
pub use frame::OpenRequest;
pub use frame::StreamId;
pub use frame::peek_stream_id;
pub use value::Wire;

/// Opaque encoded bytes of one argument set or stream item.
pub type Payload = Vec<u8>;
