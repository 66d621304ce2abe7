//! Envelope codec for terminal socket messages.
//!
//! # Message Format
//!
//! Every binary socket message carries exactly one envelope:
//! - 1 byte: type tag
//! - N bytes: payload
//!
//! | Tag | Kind     | Payload                               | Direction        |
//! |-----|----------|---------------------------------------|------------------|
//! | `0` | `Data`   | raw terminal bytes                    | both             |
//! | `1` | `Resize` | `cols: u16` BE, `rows: u16` BE        | client → server  |
//! | `2` | `Toast`  | UTF-8 text                            | server → client  |
//!
//! Tagging the payload lets a client tell process output apart from
//! out-of-band notices without guessing at the content.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Tag byte for terminal data.
pub const TAG_DATA: u8 = 0;

/// Tag byte for a terminal resize request.
pub const TAG_RESIZE: u8 = 1;

/// Tag byte for an out-of-band notice.
pub const TAG_TOAST: u8 = 2;

/// Exact payload length of a resize envelope.
pub const RESIZE_PAYLOAD_LEN: usize = 4;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size.
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// The kind of an envelope, as carried by its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    Resize,
    Toast,
}

impl MessageKind {
    /// Map a tag byte to its kind.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_DATA => Ok(Self::Data),
            TAG_RESIZE => Ok(Self::Resize),
            TAG_TOAST => Ok(Self::Toast),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// The tag byte for this kind.
    #[inline]
    pub fn tag(self) -> u8 {
        match self {
            Self::Data => TAG_DATA,
            Self::Resize => TAG_RESIZE,
            Self::Toast => TAG_TOAST,
        }
    }
}

/// A decoded socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Terminal bytes: keystrokes inbound, process output outbound.
    Data(Vec<u8>),
    /// Client-requested terminal size change.
    Resize(TerminalSize),
    /// User-visible notice that is not part of the process output.
    Toast(String),
}

impl WireMessage {
    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Data(_) => MessageKind::Data,
            Self::Resize(_) => MessageKind::Resize,
            Self::Toast(_) => MessageKind::Toast,
        }
    }

    /// Encode the message into a tagged envelope.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = match self {
            Self::Data(bytes) => bytes.len(),
            Self::Resize(_) => RESIZE_PAYLOAD_LEN,
            Self::Toast(text) => text.len(),
        };
        let mut out = Vec::with_capacity(1 + payload_len);
        out.push(self.kind().tag());
        match self {
            Self::Data(bytes) => out.extend_from_slice(bytes),
            Self::Resize(size) => {
                out.extend_from_slice(&size.cols.to_be_bytes());
                out.extend_from_slice(&size.rows.to_be_bytes());
            }
            Self::Toast(text) => out.extend_from_slice(text.as_bytes()),
        }
        out
    }

    /// Decode a tagged envelope.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&tag, payload) = data.split_first().ok_or(ProtocolError::EmptyMessage)?;

        match MessageKind::from_tag(tag)? {
            MessageKind::Data => Ok(Self::Data(payload.to_vec())),
            MessageKind::Resize => {
                if payload.len() != RESIZE_PAYLOAD_LEN {
                    return Err(ProtocolError::MalformedResize {
                        expected: RESIZE_PAYLOAD_LEN,
                        got: payload.len(),
                    });
                }
                let cols = u16::from_be_bytes([payload[0], payload[1]]);
                let rows = u16::from_be_bytes([payload[2], payload[3]]);
                Ok(Self::Resize(TerminalSize::new(cols, rows)))
            }
            MessageKind::Toast => std::str::from_utf8(payload)
                .map(|text| Self::Toast(text.to_string()))
                .map_err(|_| ProtocolError::InvalidToastText),
        }
    }
}
