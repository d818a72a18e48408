//! # IPC Message Layer
//!
//! Message layout and payload marshalling for the transfer engine.
//!
//! ## Philosophy
//!
//! - **Fixed-size slots**: every message occupies exactly one slot of a
//!   receive buffer; header plus payload must fit.
//! - **Self-describing payloads**: payloads are ordered sequences of values
//!   encoded with `serde_json`, so a malformed message decodes into an
//!   error code rather than garbage.
//! - **Codes first**: reply payloads start with a raw error code.

pub mod message;
pub mod stream;

pub use message::{Message, MessageHeader, HEADER_SIZE};
pub use stream::{IStream, OStream};
