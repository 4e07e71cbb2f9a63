//! Self-delimiting wire encoding for protocol messages
//!
//! Frame layout:
//!
//! ```text
//! magic "FTX1" (4) | kind (1) | payload length, LE (4) | bincode payload
//! ```
//!
//! The core never touches a transport; these helpers turn message values into
//! blobs and back, plus a thin file collaborator for the step-per-file flow.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Frame magic
pub const MAGIC: [u8; 4] = *b"FTX1";

/// Header size before the payload
pub const HEADER_LEN: usize = 9;

/// Message kind tag carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    NegoRequest = 1,
    NegoResponse = 2,
    Request = 3,
    Response = 4,
    Receipt = 5,
    Secret = 6,
    Claim = 7,
}

impl MessageKind {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageKind::NegoRequest,
            2 => MessageKind::NegoResponse,
            3 => MessageKind::Request,
            4 => MessageKind::Response,
            5 => MessageKind::Receipt,
            6 => MessageKind::Secret,
            7 => MessageKind::Claim,
            other => {
                return Err(Error::Deserialization(format!(
                    "unknown message kind {}",
                    other
                )))
            }
        })
    }
}

/// A protocol message that can travel as a framed blob
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Kind tag written into the frame header
    const KIND: MessageKind;
}

/// Encode a message into a framed blob
pub fn encode<T: WireMessage>(message: &T) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Serialization(format!("payload of {} bytes", payload.len())))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(T::KIND as u8);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read the kind of a framed blob without decoding the payload
pub fn peek_kind(bytes: &[u8]) -> Result<MessageKind> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Deserialization(format!(
            "frame too short: need {}, have {}",
            HEADER_LEN,
            bytes.len()
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::Deserialization("bad frame magic".into()));
    }
    MessageKind::from_u8(bytes[4])
}

/// Decode a framed blob, rejecting wrong kinds, truncation and trailing bytes
pub fn decode<T: WireMessage>(bytes: &[u8]) -> Result<T> {
    let kind = peek_kind(bytes)?;
    if kind != T::KIND {
        return Err(Error::Deserialization(format!(
            "expected {:?}, found {:?}",
            T::KIND,
            kind
        )));
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[5..HEADER_LEN]);
    let len = u32::from_le_bytes(len) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Deserialization(format!(
            "payload length {} does not match header {}",
            payload.len(),
            len
        )));
    }

    let (message, read): (T, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
    if read != payload.len() {
        return Err(Error::Deserialization(format!(
            "{} trailing bytes after {:?}",
            payload.len() - read,
            kind
        )));
    }
    Ok(message)
}

/// Write a framed message to `path`
pub fn write_message<T: WireMessage>(path: impl AsRef<Path>, message: &T) -> Result<()> {
    std::fs::write(path, encode(message)?)?;
    Ok(())
}

/// Read a framed message from `path`
pub fn read_message<T: WireMessage>(path: impl AsRef<Path>) -> Result<T> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}
