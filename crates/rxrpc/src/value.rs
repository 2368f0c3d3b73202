//! # Scalar Values
//!
//! The minimal value codec used by typed registration and typed host calls.
//! Business types bring their own encoding; they only need to implement `Wire`.
//!
//! - Integers and floats: fixed-width little-endian, no tag.
//! - `String`: raw UTF-8, the frame payload supplies the length.
//! - `Vec<u8>`: passed through untouched.
//! - `()`: empty payload.

use crate::codec::Reader;
use crate::error::FrameError;

/// A value that can travel as a frame payload.
pub trait Wire: Sized + Send + 'static {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, FrameError>;
}

impl Wire for () {
    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Reader::new(bytes).finish()
    }
}

impl Wire for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(bytes);
        let b = r.u8()?;
        r.finish()?;
        match b {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(FrameError::InvalidValue("bool must be 0 or 1")),
        }
    }
}

macro_rules! wire_le {
    ($($ty:ty => $read:ident as $raw:ty),* $(,)?) => {
        $(
            impl Wire for $ty {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
                    let mut r = Reader::new(bytes);
                    let raw: $raw = r.$read()?;
                    r.finish()?;
                    Ok(<$ty>::from_le_bytes(raw.to_le_bytes()))
                }
            }
        )*
    };
}

wire_le! {
    u32 => u32 as u32,
    i32 => u32 as u32,
    u64 => u64 as u64,
    i64 => u64 as u64,
    f64 => u64 as u64,
}

impl Wire for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8)
    }
}

impl Wire for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(bytes.to_vec())
    }
}
