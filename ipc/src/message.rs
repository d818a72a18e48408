//! Message header and slot layout

use core_types::{EpId, Label, PeId};
use serde::{Deserialize, Serialize};

/// Bytes of a slot taken up by the header
pub const HEADER_SIZE: usize = 32;

/// Header written by the transfer engine in front of every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Label of the send endpoint the message went through
    pub label: Label,
    /// Payload length in bytes
    pub length: usize,
    /// Endpoint at the sender that receives the reply, if any
    pub reply_ep: Option<EpId>,
    /// Label the reply will carry
    pub reply_label: Label,
    /// Processing element of the sender
    pub sender_pe: PeId,
    /// Send endpoint at the sender; replies return its credit
    pub sender_ep: EpId,
    /// Set on replies
    pub is_reply: bool,
}

/// A message as it sits in a receive slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message, filling in the payload length
    pub fn new(mut header: MessageHeader, payload: Vec<u8>) -> Self {
        header.length = payload.len();
        Self { header, payload }
    }

    /// Total number of slot bytes the message needs
    pub fn slot_bytes(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Returns true if the message fits into a slot of `1 << msg_order` bytes
    pub fn fits(payload_len: usize, msg_order: u8) -> bool {
        HEADER_SIZE + payload_len <= slot_size(msg_order)
    }
}

/// Slot size in bytes for a message order
pub fn slot_size(msg_order: u8) -> usize {
    1usize.checked_shl(u32::from(msg_order)).unwrap_or(usize::MAX)
}
