//! Work loop dispatch and queued sends

use core_types::Code;
use gates::{RecvGate, SendGate, SendQueue};
use std::cell::RefCell;
use std::rc::Rc;
use tests_ipc::{boot, drain_replies, run_program};

#[test]
fn test_one_message_per_round() {
    let platform = boot();
    let code = run_program(&platform, "loop", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, 3).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        rgate.subscribe(move |msg| {
            log.borrow_mut().push(msg.payload().to_vec());
            msg.reply(b"")
        });
        assert!(env.workloop().has_items());

        sgate.send(b"a").unwrap();
        sgate.send(b"b").unwrap();
        assert_eq!(env.workloop().tick(env), Ok(true));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(env.workloop().tick(env), Ok(true));
        assert_eq!(env.workloop().tick(env), Ok(false));
        assert_eq!(*seen.borrow(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(sgate.credits(), Ok(Some(3)));

        rgate.unsubscribe();
        assert!(!env.workloop().has_items());
        drain_replies(env);
    });
    assert_eq!(code, 0);
}

#[test]
fn test_labels_select_the_handler() {
    let platform = boot();
    let code = run_program(&platform, "labels", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let other = RecvGate::create(rgate.buf(), 7);
        let to_first = SendGate::create(&rgate, 1).unwrap();
        let to_other = SendGate::create(&other, 1).unwrap();

        let hits = Rc::new(RefCell::new(Vec::new()));
        for (gate, name) in [(&rgate, "first"), (&other, "other")] {
            let hits = hits.clone();
            gate.subscribe(move |msg| {
                hits.borrow_mut().push(name);
                msg.reply(b"")
            });
        }

        to_other.send(b"x").unwrap();
        to_first.send(b"y").unwrap();
        env.workloop().tick(env).unwrap();
        env.workloop().tick(env).unwrap();
        assert_eq!(*hits.borrow(), vec!["other", "first"]);
        drain_replies(env);
    });
    assert_eq!(code, 0);
}

#[test]
fn test_handler_error_ends_the_loop() {
    let platform = boot();
    let code = run_program(&platform, "failing", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, 1).unwrap();
        rgate.subscribe(|msg| {
            msg.ack();
            Err(Code::EndOfFile)
        });
        sgate.send(b"stop").unwrap();
        assert_eq!(env.run(), Err(Code::EndOfFile));
    });
    assert_eq!(code, 0);
}

#[test]
fn test_stop_lets_the_loop_finish() {
    let platform = boot();
    let code = run_program(&platform, "stop", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = SendGate::create(&rgate, 1).unwrap();
        let wl = env.clone();
        rgate.subscribe(move |msg| {
            wl.workloop().stop();
            msg.reply(b"")
        });
        sgate.send(b"last").unwrap();
        assert_eq!(env.run(), Ok(()));
        assert!(!env.workloop().has_items());
        drain_replies(env);
    });
    assert_eq!(code, 0);
}

#[test]
fn test_send_queue_keeps_order_and_bound() {
    let platform = boot();
    let code = run_program(&platform, "queue", |env| {
        let rgate = RecvGate::new(env, 10, 8).unwrap();
        let sgate = Rc::new(SendGate::create(&rgate, 1).unwrap());
        let (queue, _item) = SendQueue::with_capacity(env, 2);

        queue.send(&sgate, b"1".to_vec()).unwrap();
        assert!(queue.is_empty());
        queue.send(&sgate, b"2".to_vec()).unwrap();
        queue.send(&sgate, b"3".to_vec()).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.send(&sgate, b"4".to_vec()), Err(Code::NoSpace));

        let mut order = Vec::new();
        for _ in 0..3 {
            let mut msg = rgate.fetch().unwrap();
            order.push(msg.payload().to_vec());
            msg.reply(b"").unwrap();
            // the credit is back, the loop sends the next one
            env.workloop().tick(env).unwrap();
        }
        assert_eq!(order, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert!(queue.is_empty());
        assert!(rgate.fetch().is_none());
        drain_replies(env);
    });
    assert_eq!(code, 0);
}
