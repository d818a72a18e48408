//! Credit accounting of send gates

use core_types::Code;
use dtu::UNLIMITED_CREDITS;
use gates::{RecvGate, SendGate};
use tests_ipc::{boot, drain_replies, run_program};

#[test]
fn test_send_takes_credit_and_reply_returns_it() {
    let platform = boot();
    let code = run_program(&platform, "credits", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, 2).unwrap();
        assert_eq!(sgate.credits(), Ok(Some(2)));

        sgate.send(b"one").unwrap();
        sgate.send(b"two").unwrap();
        assert_eq!(sgate.credits(), Ok(Some(0)));
        assert_eq!(sgate.send(b"three"), Err(Code::MissCredits));

        let mut msg = rgate.fetch().unwrap();
        assert_eq!(msg.payload(), b"one");
        msg.reply(b"ok").unwrap();
        assert_eq!(sgate.credits(), Ok(Some(1)));
        sgate.send(b"three").unwrap();
        assert_eq!(drain_replies(env), 1);
    });
    assert_eq!(code, 0);
}

#[test]
fn test_ack_keeps_credit() {
    let platform = boot();
    let code = run_program(&platform, "ack", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, 1).unwrap();
        sgate.send(b"one").unwrap();

        let mut msg = rgate.fetch().unwrap();
        msg.ack();
        assert_eq!(sgate.credits(), Ok(Some(0)));
        assert_eq!(sgate.send(b"two"), Err(Code::MissCredits));
    });
    assert_eq!(code, 0);
}

#[test]
fn test_unlimited_gate_reports_full_ring() {
    let platform = boot();
    let code = run_program(&platform, "unlimited", |env| {
        // four slots
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, UNLIMITED_CREDITS).unwrap();
        assert_eq!(sgate.credits(), Ok(None));

        for i in 0..4u8 {
            sgate.send(&[i]).unwrap();
        }
        assert_eq!(sgate.send(b"lost?"), Err(Code::NoRingSpace));

        // nothing was overwritten
        let msg = rgate.fetch().unwrap();
        assert_eq!(msg.payload(), &[0]);
        drop(msg);
        sgate.send(b"fits again").unwrap();
    });
    assert_eq!(code, 0);
}

#[test]
fn test_oversized_message_is_rejected() {
    let platform = boot();
    let code = run_program(&platform, "oversized", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, 1).unwrap();
        assert_eq!(sgate.send(&[0u8; 256]), Err(Code::InvArgs));
        assert_eq!(sgate.credits(), Ok(Some(1)));
    });
    assert_eq!(code, 0);
}
