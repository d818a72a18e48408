//! Application-side engine handle

use crate::endpoint::EpConfig;
use crate::engine::Command;
use crate::fabric::{Fabric, PeState};
use crate::ringbuf::Fetched;
use core_types::{Code, EpId, Label, PeId, Result};
use std::hint;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handle to one PE's transfer engine
///
/// Commands are issued one at a time through the command register; the
/// receive side is read straight out of the endpoint's slots.
#[derive(Clone)]
pub struct Dtu {
    state: Arc<PeState>,
    fabric: Arc<Fabric>,
}

impl Dtu {
    pub(crate) fn new(state: Arc<PeState>, fabric: Arc<Fabric>) -> Self {
        Self { state, fabric }
    }

    /// The PE this engine currently belongs to
    pub fn pe(&self) -> PeId {
        self.state.pe()
    }

    /// The interconnect the PE is attached to
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Returns false once the PE was powered down
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Registers the calling thread to be woken on message arrival
    pub fn bind_current_thread(&self) {
        self.state.bind_app(thread::current());
    }

    fn issue(&self, cmd: Command, accepted_is_done: bool) -> Result<Vec<u8>> {
        let mut spins = 0u32;
        while !self.state.cmd.claim() {
            if !self.is_alive() {
                return Err(Code::VpeGone);
            }
            backoff(&mut spins);
        }
        self.state.cmd.submit(cmd);
        self.state.wake_engine();

        spins = 0;
        loop {
            if let Some(res) = self.state.cmd.poll(accepted_is_done) {
                return res;
            }
            if !self.is_alive() {
                return Err(Code::VpeGone);
            }
            backoff(&mut spins);
        }
    }

    /// Sends `payload` through send endpoint `ep`
    ///
    /// The reply, if any, goes to `reply_ep` and carries `reply_label`.
    pub fn send(
        &self,
        ep: EpId,
        payload: &[u8],
        reply_label: Label,
        reply_ep: Option<EpId>,
    ) -> Result<()> {
        self.issue(
            Command::Send {
                ep,
                payload: payload.to_vec(),
                reply_ep,
                reply_label,
            },
            false,
        )
        .map(|_| ())
    }

    /// Replies to the message in `slot` of receive endpoint `ep`
    ///
    /// Returns one credit to the sender and frees the slot.
    pub fn reply(&self, ep: EpId, slot: usize, payload: &[u8]) -> Result<()> {
        self.issue(
            Command::Reply {
                ep,
                slot,
                payload: payload.to_vec(),
            },
            false,
        )
        .map(|_| ())
    }

    /// Reads `len` bytes at `offset` through memory endpoint `ep`
    pub fn read(&self, ep: EpId, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.issue(Command::Read { ep, offset, len }, false)
    }

    /// Writes `data` at `offset`; returns once the engine took the data
    pub fn write(&self, ep: EpId, offset: u64, data: &[u8]) -> Result<()> {
        self.issue(
            Command::Write {
                ep,
                offset,
                data: data.to_vec(),
            },
            true,
        )
        .map(|_| ())
    }

    /// Atomically replaces `expected` by `new` at `offset`
    ///
    /// Returns `Ok(false)` without side effect if the bytes differ.
    pub fn cmpxchg(&self, ep: EpId, offset: u64, expected: &[u8], new: &[u8]) -> Result<bool> {
        let res = self.issue(
            Command::CmpXchg {
                ep,
                offset,
                expected: expected.to_vec(),
                new: new.to_vec(),
            },
            false,
        )?;
        Ok(res.first() == Some(&1))
    }

    /// Takes the oldest unread message of receive endpoint `ep`
    pub fn fetch_msg(&self, ep: EpId) -> Option<Fetched> {
        self.state.ep(ep).ok()?.ring().fetch()
    }

    /// Frees the slot of a fetched message without replying
    pub fn ack(&self, ep: EpId, slot: usize) {
        if let Ok(rep) = self.state.ep(ep) {
            rep.ring().ack(slot);
        }
    }

    /// Returns true if receive endpoint `ep` has unread messages
    pub fn has_msgs(&self, ep: EpId) -> bool {
        self.state
            .ep(ep)
            .map(|e| e.ring().has_msgs())
            .unwrap_or(false)
    }

    /// Current configuration of endpoint `ep`
    pub fn ep_config(&self, ep: EpId) -> EpConfig {
        self.state
            .ep(ep)
            .map(|e| e.snapshot())
            .unwrap_or(EpConfig::Invalid)
    }

    /// Returns true if the kernel configured endpoint `ep`
    pub fn is_valid(&self, ep: EpId) -> bool {
        self.ep_config(ep).is_valid()
    }

    /// Live credits of send endpoint `ep`; `None` if unlimited
    pub fn credits(&self, ep: EpId) -> Option<u32> {
        self.state.ep(ep).ok()?.credits()
    }

    /// Sleeps until a message arrives or the wait timeout passes
    pub fn wait(&self) {
        if self.is_alive() {
            thread::park_timeout(Duration::from_micros(self.fabric.config().wait_timeout_us));
        }
    }
}

fn backoff(spins: &mut u32) {
    if *spins < 64 {
        hint::spin_loop();
        *spins += 1;
    } else {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{MemConfig, RecvConfig, SendConfig};
    use crate::fabric::DtuConfig;
    use crate::UNLIMITED_CREDITS;
    use core_types::MemoryPerms;

    const SEP: EpId = 3;
    const REP: EpId = 4;
    const RPL: EpId = 5;
    const MEP: EpId = 6;

    struct Pair {
        fabric: Arc<Fabric>,
        a: Dtu,
        b: Dtu,
    }

    fn pair(credits: u32) -> Pair {
        let fabric = Fabric::new(DtuConfig {
            max_pes: 4,
            mem_size: 4096,
            ..DtuConfig::default()
        });
        let a = fabric.create_pe().unwrap();
        let b = fabric.create_pe().unwrap();
        let recv = EpConfig::Receive(RecvConfig {
            order: 10,
            msg_order: 8,
        });
        fabric.configure(b.pe(), REP, recv).unwrap();
        fabric.configure(a.pe(), RPL, recv).unwrap();
        fabric
            .configure(
                a.pe(),
                SEP,
                EpConfig::Send(SendConfig {
                    target_pe: b.pe(),
                    target_ep: REP,
                    label: 0x42,
                    msg_order: 8,
                    credits,
                }),
            )
            .unwrap();
        Pair { fabric, a, b }
    }

    fn fetch_blocking(d: &Dtu, ep: EpId) -> Fetched {
        for _ in 0..10_000 {
            if let Some(f) = d.fetch_msg(ep) {
                return f;
            }
            d.wait();
        }
        panic!("no message on ep {ep}");
    }

    #[test]
    fn test_send_reply_round_trip() {
        let p = pair(1);
        p.a.send(SEP, b"ping", 7, Some(RPL)).unwrap();
        let msg = fetch_blocking(&p.b, REP);
        assert_eq!(msg.payload, b"ping");
        assert_eq!(msg.header.label, 0x42);
        assert_eq!(msg.header.sender_pe, p.a.pe());
        assert_eq!(p.a.credits(SEP), Some(0));

        p.b.reply(REP, msg.slot, b"pong").unwrap();
        let reply = fetch_blocking(&p.a, RPL);
        assert_eq!(reply.payload, b"pong");
        assert_eq!(reply.header.label, 7);
        assert!(reply.header.is_reply);
        assert_eq!(p.a.credits(SEP), Some(1));
        p.a.ack(RPL, reply.slot);
    }

    #[test]
    fn test_missing_credits() {
        let p = pair(1);
        p.a.send(SEP, b"1", 0, Some(RPL)).unwrap();
        assert_eq!(p.a.send(SEP, b"2", 0, Some(RPL)), Err(Code::MissCredits));
    }

    #[test]
    fn test_full_ring_refunds_credit() {
        let p = pair(UNLIMITED_CREDITS);
        for _ in 0..4 {
            p.a.send(SEP, b"x", 0, None).unwrap();
        }
        assert_eq!(p.a.send(SEP, b"x", 0, None), Err(Code::NoRingSpace));
    }

    #[test]
    fn test_oversized_message() {
        let p = pair(1);
        let big = vec![0u8; 256];
        assert_eq!(p.a.send(SEP, &big, 0, None), Err(Code::InvArgs));
        assert_eq!(p.a.credits(SEP), Some(1));
    }

    #[test]
    fn test_peer_lifetime_errors() {
        let p = pair(2);
        assert_eq!(p.a.send(4, b"x", 0, None), Err(Code::EpInvalid));

        p.fabric.configure(p.b.pe(), REP, EpConfig::Invalid).unwrap();
        assert_eq!(p.a.send(SEP, b"x", 0, None), Err(Code::RecvGone));

        p.fabric.remove_pe(p.b.pe());
        assert_eq!(p.a.send(SEP, b"x", 0, None), Err(Code::VpeGone));
        assert_eq!(p.a.credits(SEP), Some(2));
    }

    #[test]
    fn test_memory_endpoint() {
        let p = pair(1);
        let cfg = |perms| {
            EpConfig::Memory(MemConfig {
                addr: 128,
                size: 16,
                perms,
            })
        };
        p.fabric
            .configure(p.a.pe(), MEP, cfg(MemoryPerms::read_write()))
            .unwrap();
        p.a.write(MEP, 4, b"abcd").unwrap();
        assert_eq!(p.a.read(MEP, 4, 4).unwrap(), b"abcd");
        assert_eq!(p.fabric.memory().read(132, 4).unwrap(), b"abcd");
        assert_eq!(p.a.read(MEP, 14, 4), Err(Code::InvArgs));
        assert!(p.a.cmpxchg(MEP, 4, b"abcd", b"wxyz").unwrap());
        assert!(!p.a.cmpxchg(MEP, 4, b"abcd", b"0000").unwrap());
        assert_eq!(p.a.read(MEP, 4, 4).unwrap(), b"wxyz");

        p.fabric
            .configure(p.a.pe(), MEP, cfg(MemoryPerms::read_only()))
            .unwrap();
        assert_eq!(p.a.write(MEP, 0, b"x"), Err(Code::NoPerm));
        assert_eq!(p.a.cmpxchg(MEP, 4, b"w", b"v"), Err(Code::NoPerm));
    }

    #[test]
    fn test_dead_pe_fails_commands() {
        let p = pair(1);
        p.fabric.remove_pe(p.a.pe());
        assert_eq!(p.a.send(SEP, b"x", 0, None), Err(Code::VpeGone));
    }

    #[test]
    fn test_migrated_target_is_gone_until_reconfigured() {
        let p = pair(UNLIMITED_CREDITS);
        let new_pe = p.fabric.migrate(p.b.pe()).unwrap();
        assert_eq!(p.a.send(SEP, b"x", 0, None), Err(Code::VpeGone));
        p.fabric
            .configure(
                p.a.pe(),
                SEP,
                EpConfig::Send(SendConfig {
                    target_pe: new_pe,
                    target_ep: REP,
                    label: 0,
                    msg_order: 8,
                    credits: UNLIMITED_CREDITS,
                }),
            )
            .unwrap();
        p.a.send(SEP, b"x", 0, None).unwrap();
        assert_eq!(fetch_blocking(&p.b, REP).payload, b"x");
    }
}
