//! Receive buffer slots
//!
//! Each slot walks FREE → WRITING → FULL → FETCHED → FREE. Delivering
//! engines claim a FREE slot with a CAS, the owning application claims a
//! FULL slot with a CAS; whoever wins the CAS has the slot's message cell
//! to itself until it publishes the next state with a release store.
//!
//! Every delivery draws a sequence number and fetch always takes the
//! lowest FULL one, so messages from one sending endpoint are consumed in
//! the order they were sent.

use crate::MAX_MSG_SLOTS;
use core_types::{Code, Result};
use ipc::{Message, MessageHeader};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

const FREE: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;
const FETCHED: u8 = 3;

struct Slot {
    state: AtomicU8,
    seq: AtomicU64,
    msg: UnsafeCell<Option<Message>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            seq: AtomicU64::new(0),
            msg: UnsafeCell::new(None),
        }
    }
}

/// A message taken out of a receive buffer
///
/// The slot stays occupied until it is acknowledged or replied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Index of the slot the message occupies
    pub slot: usize,
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// Slot array of one receive endpoint
pub struct RingBuffer {
    slots: Box<[Slot]>,
    count: AtomicUsize,
    write_pos: AtomicUsize,
    next_seq: AtomicU64,
}

// SAFETY: a slot's message cell is only touched by the thread that moved
// the slot into WRITING (producer) or FETCHED (consumer) with a successful
// CAS; the following release store hands it over.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a buffer without usable slots
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_MSG_SLOTS).map(|_| Slot::new()).collect(),
            count: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Resizes the buffer to `count` usable slots and drops queued messages
    ///
    /// Fetched slots stay owned by the application until acknowledged;
    /// deliveries already in progress complete into the new layout.
    pub(crate) fn reset(&self, count: usize) {
        for slot in self.slots.iter() {
            let _ = slot
                .state
                .compare_exchange(FULL, FREE, Ordering::AcqRel, Ordering::Relaxed);
        }
        self.write_pos.store(0, Ordering::Relaxed);
        self.count.store(count.min(MAX_MSG_SLOTS), Ordering::Release);
    }

    /// Number of usable slots
    pub fn capacity(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Stores a message into a free slot
    pub fn push(&self, msg: Message) -> Result<()> {
        let count = self.capacity();
        let start = self.write_pos.fetch_add(1, Ordering::Relaxed);
        for i in 0..count {
            let slot = &self.slots[(start + i) % count];
            if slot
                .state
                .compare_exchange(FREE, WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                // SAFETY: WRITING was claimed by this thread above.
                unsafe { *slot.msg.get() = Some(msg) };
                slot.seq.store(seq, Ordering::Relaxed);
                slot.state.store(FULL, Ordering::Release);
                return Ok(());
            }
        }
        Err(Code::NoRingSpace)
    }

    fn oldest_full(&self, count: usize) -> Option<(usize, u64)> {
        let mut oldest: Option<(usize, u64)> = None;
        for (idx, slot) in self.slots[..count].iter().enumerate() {
            if slot.state.load(Ordering::Acquire) == FULL {
                let seq = slot.seq.load(Ordering::Relaxed);
                if oldest.map_or(true, |(_, s)| seq < s) {
                    oldest = Some((idx, seq));
                }
            }
        }
        oldest
    }

    /// Takes the oldest unread message, leaving its slot occupied
    pub fn fetch(&self) -> Option<Fetched> {
        let count = self.capacity();
        loop {
            // A scan that acquired a slot sees every earlier delivery of the
            // same sender; two agreeing scans make the choice stable.
            let mut oldest = self.oldest_full(count)?;
            loop {
                let again = self.oldest_full(count)?;
                if again == oldest {
                    break;
                }
                oldest = again;
            }
            let (idx, _) = oldest;
            let slot = &self.slots[idx];
            if slot
                .state
                .compare_exchange(FULL, FETCHED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: FETCHED was claimed by this thread above.
                let msg = unsafe { (*slot.msg.get()).as_ref() };
                return msg.map(|m| Fetched {
                    slot: idx,
                    header: m.header,
                    payload: m.payload.clone(),
                });
            }
        }
    }

    /// Header of a fetched message, needed to route its reply
    pub fn header(&self, idx: usize) -> Result<MessageHeader> {
        let slot = self.slots.get(idx).ok_or(Code::InvArgs)?;
        if slot.state.load(Ordering::Acquire) != FETCHED {
            return Err(Code::InvArgs);
        }
        // SAFETY: only the consumer that fetched the slot reads it while FETCHED.
        unsafe { (*slot.msg.get()).as_ref() }
            .map(|m| m.header)
            .ok_or(Code::InvArgs)
    }

    /// Frees the slot of a fetched message
    pub fn ack(&self, idx: usize) -> bool {
        let Some(slot) = self.slots.get(idx) else {
            return false;
        };
        if slot.state.load(Ordering::Acquire) != FETCHED {
            return false;
        }
        // SAFETY: see header(); the release store below publishes the cleared cell.
        unsafe { *slot.msg.get() = None };
        slot.state.store(FREE, Ordering::Release);
        true
    }

    /// Returns true if an unread message is waiting
    pub fn has_msgs(&self) -> bool {
        let count = self.capacity();
        self.slots[..count]
            .iter()
            .any(|s| s.state.load(Ordering::Acquire) == FULL)
    }

    /// Number of slots not free
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.load(Ordering::Acquire) != FREE)
            .count()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::PeId;
    use std::sync::Arc;
    use std::thread;

    fn msg(label: u64, payload: &[u8]) -> Message {
        Message::new(
            MessageHeader {
                label,
                length: 0,
                reply_ep: None,
                reply_label: 0,
                sender_pe: PeId::new(1),
                sender_ep: 3,
                is_reply: false,
            },
            payload.to_vec(),
        )
    }

    #[test]
    fn test_unconfigured_buffer_rejects() {
        let rb = RingBuffer::new();
        assert_eq!(rb.push(msg(0, b"x")), Err(Code::NoRingSpace));
        assert!(rb.fetch().is_none());
    }

    #[test]
    fn test_slot_lifecycle() {
        let rb = RingBuffer::new();
        rb.reset(2);
        rb.push(msg(1, b"a")).unwrap();
        rb.push(msg(2, b"b")).unwrap();
        assert_eq!(rb.push(msg(3, b"c")), Err(Code::NoRingSpace));

        let first = rb.fetch().unwrap();
        assert_eq!(first.header.label, 1);
        assert_eq!(first.payload, b"a");
        // fetched but not acked still occupies its slot
        assert_eq!(rb.push(msg(3, b"c")), Err(Code::NoRingSpace));
        assert_eq!(rb.header(first.slot).unwrap().label, 1);

        assert!(rb.ack(first.slot));
        assert!(!rb.ack(first.slot));
        rb.push(msg(3, b"c")).unwrap();
        assert_eq!(rb.occupied(), 2);
    }

    #[test]
    fn test_fetch_in_send_order() {
        let rb = RingBuffer::new();
        rb.reset(8);
        for i in 0..8 {
            rb.push(msg(i, b"")).unwrap();
        }
        for i in 0..4 {
            let f = rb.fetch().unwrap();
            assert_eq!(f.header.label, i);
            rb.ack(f.slot);
        }
        for i in 8..12 {
            rb.push(msg(i, b"")).unwrap();
        }
        for i in 4..12 {
            let f = rb.fetch().unwrap();
            assert_eq!(f.header.label, i);
            rb.ack(f.slot);
        }
        assert!(!rb.has_msgs());
    }

    #[test]
    fn test_header_requires_fetch() {
        let rb = RingBuffer::new();
        rb.reset(1);
        rb.push(msg(0, b"")).unwrap();
        assert_eq!(rb.header(0), Err(Code::InvArgs));
        assert_eq!(rb.header(MAX_MSG_SLOTS), Err(Code::InvArgs));
    }

    #[test]
    fn test_reset_drops_queued_but_keeps_fetched() {
        let rb = RingBuffer::new();
        rb.reset(4);
        rb.push(msg(1, b"")).unwrap();
        rb.push(msg(2, b"")).unwrap();
        let f = rb.fetch().unwrap();
        rb.reset(4);
        assert!(!rb.has_msgs());
        assert_eq!(rb.occupied(), 1);
        assert!(rb.ack(f.slot));
    }

    #[test]
    fn test_concurrent_producers_keep_per_sender_order() {
        let rb = Arc::new(RingBuffer::new());
        rb.reset(MAX_MSG_SLOTS);
        let producers: Vec<_> = (0..2u64)
            .map(|p| {
                let rb = rb.clone();
                thread::spawn(move || {
                    let mut sent = 0u64;
                    while sent < 200 {
                        if rb.push(msg(p, &sent.to_le_bytes())).is_ok() {
                            sent += 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut next = [0u64; 2];
        while next.iter().any(|n| *n < 200) {
            if let Some(f) = rb.fetch() {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&f.payload);
                let p = f.header.label as usize;
                assert_eq!(u64::from_le_bytes(raw), next[p]);
                next[p] += 1;
                rb.ack(f.slot);
            } else {
                thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }
    }
}
