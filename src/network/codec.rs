//! Binary codec for wire messages.
//!
//! All bincode configuration lives here so both channels (datagrams and the
//! reliable command stream) serialize identically on every peer.
//!
//! The reliable stream carries a sequence of length-prefixed frames:
//! a little-endian `u32` byte count followed by the bincode payload.
//! [`FrameDecoder`] reassembles those frames from arbitrary read chunks.
//!
//! # Examples
//!
//! ```
//! use netplay_rollback::network::codec::{encode, decode_value, write_frame, FrameDecoder};
//!
//! let bytes = encode(&42u32).expect("encoding should succeed");
//! let decoded: u32 = decode_value(&bytes).expect("decoding should succeed");
//! assert_eq!(decoded, 42);
//!
//! let mut stream = Vec::new();
//! write_frame(&"hello", &mut stream).expect("framing should succeed");
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&stream[..3]);
//! assert!(decoder.next_frame::<String>().expect("valid").is_none());
//! decoder.push(&stream[3..]);
//! assert_eq!(decoder.next_frame::<String>().expect("valid").as_deref(), Some("hello"));
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Largest frame accepted on the reliable stream. Savestates travel on it, so this is generous.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

// Fixed-size integers keep datagram sizes independent of the values inside them.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a datagram or command.
    Encode,
    /// Decoding a datagram or command.
    Decode,
    /// Encoding into a caller-provided buffer.
    EncodeIntoBuffer,
    /// Splitting the reliable stream into frames.
    StreamFraming,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
            Self::StreamFraming => write!(f, "framing stream data"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their text is kept as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// A stream frame announced a length above [`MAX_FRAME_LEN`].
    FrameTooLarge {
        /// The announced length.
        len: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::FrameTooLarge { len } => {
                write!(
                    f,
                    "stream frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"
                )
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value into an existing byte slice, returning the number of bytes written.
///
/// Used on the datagram path with the socket's preallocated send buffer.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeIntoBuffer))
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// Appends one length-prefixed frame holding `value` to `out`.
pub fn write_frame<T: Serialize>(value: &T, out: &mut Vec<u8>) -> CodecResult<usize> {
    let payload = encode(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len: payload.len() });
    }
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(LEN_PREFIX + payload.len())
}

/// Reassembles length-prefixed frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame, or `Ok(None)` if more bytes are needed.
    ///
    /// A frame that fails to decode is consumed before the error is returned,
    /// so one bad frame does not wedge the stream.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> CodecResult<Option<T>> {
        let Some(prefix) = self.buffer.get(..LEN_PREFIX) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge { len });
        }
        if self.buffer.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..LEN_PREFIX + len).skip(LEN_PREFIX).collect();
        decode_value(&frame)
            .map(Some)
            .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::StreamFraming))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{Command, ConfigItem};
    use crate::Frame;

    #[test]
    fn command_survives_encoding() {
        let original = Command::FlipPlayers {
            frame: Frame::new(1234),
        };
        let bytes = encode(&original).unwrap();
        let (decoded, len): (Command, _) = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn encode_into_reports_written_len() {
        let mut buffer = [0u8; 64];
        let len = encode_into(&7u64, &mut buffer).unwrap();
        assert_eq!(len, 8, "fixed int encoding keeps u64 at 8 bytes");
        assert_eq!(decode_value::<u64>(&buffer[..len]).unwrap(), 7);
    }

    #[test]
    fn encode_into_too_small_buffer_fails() {
        let mut buffer = [0u8; 1];
        assert!(encode_into(&0x1234_5678_9ABC_DEF0u64, &mut buffer).is_err());
    }

    #[test]
    fn decode_invalid_data_fails() {
        let result: CodecResult<(u64, _)> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn decoder_handles_byte_at_a_time_delivery() {
        let mut stream = Vec::new();
        write_frame(&Command::Ack, &mut stream).unwrap();
        write_frame(
            &Command::Config(ConfigItem::Nickname("bob".to_owned())),
            &mut stream,
        )
        .unwrap();

        let mut decoder = FrameDecoder::new();
        let mut out: Vec<Command> = Vec::new();
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            while let Some(cmd) = decoder.next_frame().unwrap() {
                out.push(cmd);
            }
        }
        assert_eq!(
            out,
            vec![
                Command::Ack,
                Command::Config(ConfigItem::Nickname("bob".to_owned()))
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_rejects_oversized_prefix() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decoder.next_frame::<Command>(),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn decoder_skips_corrupt_frame() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&2u32.to_le_bytes());
        stream.extend_from_slice(&[0xFF, 0xFF]);
        write_frame(&Command::Resume, &mut stream).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert!(decoder.next_frame::<Command>().is_err());
        assert_eq!(decoder.next_frame::<Command>().unwrap(), Some(Command::Resume));
    }

    #[test]
    fn encoding_is_deterministic() {
        let cmd = Command::Pause {
            frame: Frame::new(99),
        };
        assert_eq!(encode(&cmd).unwrap(), encode(&cmd).unwrap());
    }
}
