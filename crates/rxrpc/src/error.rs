//! # Error Definitions
//!
//! The central ledger of all codec and protocol failures.
//!
//! Two families live here:
//! - `FrameError`: the bytes on the wire could not be read or written.
//! - `Error`: an exchange failed. It carries an `ErrorKind` and travels inside
//!   Error frames, so the remote side observes the same kind the local side raised.

use crate::codec::Reader;
use crate::codec::Writer;

/// Failures while encoding or decoding wire structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Byte does not correspond to a valid `FrameKind`.
    InvalidKind(u8),
    /// Byte does not correspond to a valid `ErrorKind`.
    InvalidErrorKind(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Bytes remained after the structure was fully read.
    TrailingBytes(usize),
    /// Payload length exceeds the configured or representable maximum.
    PayloadTooLarge(usize),
    /// A field value is outside the range the structure allows.
    InvalidValue(&'static str),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKind(b) => write!(f, "invalid frame kind byte: {:#04x}", b),
            Self::InvalidErrorKind(b) => write!(f, "invalid error kind byte: {:#04x}", b),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after frame", n),
            Self::PayloadTooLarge(n) => write!(f, "payload of {} bytes is too large", n),
            Self::InvalidValue(what) => write!(f, "invalid value: {}", what),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for FrameError {}

/// Classification of an exchange failure.
///
/// The tag values are part of the wire format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The handler stub was never filled in.
    Unimplemented = 0x01,
    /// No handler is registered under the requested name.
    UnknownOperation = 0x02,
    /// A handler is already registered under that name.
    DuplicateOperation = 0x03,
    /// The peer broke the frame contract (double resolution, credit overrun, ...).
    ProtocolViolation = 0x04,
    /// The exchange was canceled before it resolved.
    Cancelled = 0x05,
    /// The underlying channel failed.
    Transport = 0x06,
    /// Business error raised by a handler, with an opaque payload.
    Application = 0x07,
}

impl ErrorKind {
    /// Returns the ErrorKind for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Unimplemented),
            0x02 => Some(Self::UnknownOperation),
            0x03 => Some(Self::DuplicateOperation),
            0x04 => Some(Self::ProtocolViolation),
            0x05 => Some(Self::Cancelled),
            0x06 => Some(Self::Transport),
            0x07 => Some(Self::Application),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unimplemented => "unimplemented",
            Self::UnknownOperation => "unknown operation",
            Self::DuplicateOperation => "duplicate operation",
            Self::ProtocolViolation => "protocol violation",
            Self::Cancelled => "cancelled",
            Self::Transport => "transport",
            Self::Application => "application",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed exchange.
///
/// `data` is opaque to the core; application handlers use it to carry an
/// encoded business error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Vec<u8>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), data: Vec::new() }
    }

    pub fn unimplemented() -> Self {
        Self::new(ErrorKind::Unimplemented, "not_implemented")
    }

    pub fn unknown_operation(name: &str) -> Self {
        Self::new(ErrorKind::UnknownOperation, format!("no operation registered as '{}'", name))
    }

    pub fn duplicate_operation(name: &str) -> Self {
        Self::new(ErrorKind::DuplicateOperation, format!("operation '{}' is already registered", name))
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    /// Attaches an opaque payload, typically an encoded business error.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Encodes the error as an Error frame payload.
    ///
    /// Layout: `[kind u8][message_len u32][message][data...]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(1 + 4 + self.message.len() + self.data.len());
        w.u8(self.kind as u8);
        w.str32(&self.message);
        w.raw(&self.data);
        w.into_bytes()
    }

    /// Decodes an Error frame payload.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, FrameError> {
        let mut r = Reader::new(bytes);
        let tag = r.u8()?;
        let kind = ErrorKind::from_u8(tag).ok_or(FrameError::InvalidErrorKind(tag))?;
        let message = r.str32()?.to_string();
        let data = r.rest().to_vec();
        Ok(Self { kind, message, data })
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::protocol_violation(e.to_string())
    }
}

/// A specialized Result type for exchange outcomes.
pub type Result<T> = std::result::Result<T, Error>;
