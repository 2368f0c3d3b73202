//! # Protocol Frames
//!
//! Defines the stream-addressed envelope moving across the guest/host boundary.
//!
//! ## Wire Format
//!
//! ```text
//! [stream_id: u32][kind: u8][requested: u32, RequestN only][payload_len: u32][payload]
//! ```
//!
//! The Open payload is itself structured (see `OpenRequest`); Error payloads
//! carry an encoded `Error`. Everything else is opaque.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Exactness**: A frame decodes only if every byte is accounted for.

use crate::codec::Reader;
use crate::codec::Writer;
use crate::codec::check_len;
use crate::error::Error;
use crate::error::FrameError;

type Result<T> = std::result::Result<T, FrameError>;

/// Fixed header length: stream id + kind.
const HEADER_LEN: usize = 5;

/// Longest operation name an Open frame can carry.
pub const MAX_OPERATION_NAME: usize = u16::MAX as usize;

/// Identifies one logical exchange on a transport.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Frame discriminator. The tag values are part of the wire format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Starts an exchange; payload is an `OpenRequest`.
    Open = 0x01,
    /// One value.
    Next = 0x02,
    /// Grants credit; `requested` is set.
    RequestN = 0x03,
    /// Successful end of the sender's direction.
    Complete = 0x04,
    /// Failed end of the exchange; payload is an encoded `Error`.
    Error = 0x05,
    /// Sender is no longer interested.
    Cancel = 0x06,
}

impl FrameKind {
    /// Returns the FrameKind for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Next),
            0x03 => Some(Self::RequestN),
            0x04 => Some(Self::Complete),
            0x05 => Some(Self::Error),
            0x06 => Some(Self::Cancel),
            _ => None,
        }
    }

    /// True for the kinds that end an exchange from the sender's point of view.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancel)
    }
}

/// The atomic unit moving across the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
    /// Present only on RequestN.
    pub requested: Option<u32>,
}

impl Frame {
    fn bare(stream_id: StreamId, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { stream_id, kind, payload, requested: None }
    }

    pub fn open(stream_id: StreamId, open: &OpenRequest) -> Self {
        Self::bare(stream_id, FrameKind::Open, open.encode())
    }

    pub fn next(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self::bare(stream_id, FrameKind::Next, payload)
    }

    pub fn request_n(stream_id: StreamId, n: u32) -> Self {
        Self { stream_id, kind: FrameKind::RequestN, payload: Vec::new(), requested: Some(n) }
    }

    pub fn complete(stream_id: StreamId) -> Self {
        Self::bare(stream_id, FrameKind::Complete, Vec::new())
    }

    pub fn error(stream_id: StreamId, error: &Error) -> Self {
        Self::bare(stream_id, FrameKind::Error, error.encode())
    }

    pub fn cancel(stream_id: StreamId) -> Self {
        Self::bare(stream_id, FrameKind::Cancel, Vec::new())
    }

    /// Decodes the Open payload. Fails for any other kind.
    pub fn open_request(&self) -> Result<OpenRequest> {
        if self.kind != FrameKind::Open {
            return Err(FrameError::InvalidValue("not an Open frame"));
        }
        OpenRequest::decode(&self.payload)
    }

    /// Decodes the Error payload. Fails for any other kind.
    pub fn error_payload(&self) -> Result<Error> {
        if self.kind != FrameKind::Error {
            return Err(FrameError::InvalidValue("not an Error frame"));
        }
        Error::decode(&self.payload)
    }

    /// Encode this frame into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_len(self.payload.len())?;
        let mut w = Writer::with_capacity(HEADER_LEN + 8 + self.payload.len());
        w.u32(self.stream_id.0);
        w.u8(self.kind as u8);
        if self.kind == FrameKind::RequestN {
            let n = self.requested.ok_or(FrameError::InvalidValue("RequestN without a count"))?;
            if n == 0 {
                return Err(FrameError::InvalidValue("RequestN count must be positive"));
            }
            w.u32(n);
        }
        w.blob32(&self.payload);
        Ok(w.into_bytes())
    }

    /// Decode a frame with no payload size limit beyond the wire format's own.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_with_limit(bytes, u32::MAX as usize)
    }

    /// Decode a frame, rejecting payloads larger than `max_payload`.
    pub fn decode_with_limit(bytes: &[u8], max_payload: usize) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let stream_id = StreamId(r.u32()?);
        let tag = r.u8()?;
        let kind = FrameKind::from_u8(tag).ok_or(FrameError::InvalidKind(tag))?;

        let requested = if kind == FrameKind::RequestN {
            match r.u32()? {
                0 => return Err(FrameError::InvalidValue("RequestN count must be positive")),
                n => Some(n),
            }
        } else {
            None
        };

        let len = r.u32()? as usize;
        if len > max_payload {
            return Err(FrameError::PayloadTooLarge(len));
        }
        let payload = r.bytes(len)?.to_vec();
        r.finish()?;

        Ok(Self { stream_id, kind, payload, requested })
    }
}

/// Decodes just the stream id from a raw frame.
/// This is useful for addressing an error when the full decoding fails.
pub fn peek_stream_id(bytes: &[u8]) -> Result<StreamId> {
    let mut r = Reader::new(bytes);
    Ok(StreamId(r.u32()?))
}

/// Payload of an Open frame.
///
/// Layout: `[name_len u16][name][initial_request u32][args...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Registered operation name.
    pub operation: String,
    /// Handshake credit granted to the responder's output stream.
    pub initial_request: u32,
    /// Encoded arguments.
    pub args: Vec<u8>,
}

impl OpenRequest {
    pub fn new(operation: impl Into<String>, initial_request: u32, args: Vec<u8>) -> Self {
        Self { operation: operation.into(), initial_request, args }
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.operation.as_bytes();
        let mut w = Writer::with_capacity(2 + name.len() + 4 + self.args.len());
        // Registration rejects longer names, so truncation never hits a registered operation.
        let len = name.len().min(MAX_OPERATION_NAME);
        w.u16(len as u16);
        w.raw(&name[..len]);
        w.u32(self.initial_request);
        w.raw(&self.args);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let len = r.u16()? as usize;
        let name = std::str::from_utf8(r.bytes(len)?).map_err(|_| FrameError::InvalidUtf8)?;
        if name.is_empty() {
            return Err(FrameError::InvalidValue("empty operation name"));
        }
        let initial_request = r.u32()?;
        let args = r.rest().to_vec();
        Ok(Self { operation: name.to_string(), initial_request, args })
    }
}
