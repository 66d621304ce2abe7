//! # podterm Protocol Library
//!
//! Wire definitions shared by the podterm terminal server and its clients.
//!
//! ## Overview
//!
//! A terminal socket carries three kinds of traffic: keystrokes going to the
//! remote process, output coming back from it, and control messages (resize
//! requests, user-visible notices). Each WebSocket binary message is a single
//! tagged envelope so the two sides never have to guess which is which.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Data  │  Resize  │  Toast             │  WireMessage
//! ├─────────────────────────────────────────┤
//! │        [tag: u8][payload ...]           │  envelope
//! ├─────────────────────────────────────────┤
//! │        WebSocket binary message         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{TerminalSize, WireMessage};
//!
//! let bytes = WireMessage::Resize(TerminalSize::new(120, 40)).encode();
//! let decoded = WireMessage::decode(&bytes).unwrap();
//! assert_eq!(decoded, WireMessage::Resize(TerminalSize::new(120, 40)));
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: envelope encoding and decoding
//! - [`error`]: error types

pub mod error;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use wire::{
    MessageKind, TerminalSize, WireMessage, RESIZE_PAYLOAD_LEN, TAG_DATA, TAG_RESIZE, TAG_TOAST,
};
