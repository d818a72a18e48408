//! Memory gates: derivation, access checks and revocation

use core_types::{CapabilityEvent, Code, MemoryPerms, Ownership};
use gates::{MemGate, Vpe};
use sim_kernel::AuditEvent;
use std::sync::mpsc;
use tests_ipc::{boot, run_program};

#[test]
fn test_write_then_read() {
    let platform = boot();
    let code = run_program(&platform, "mem", |env| {
        let mem = MemGate::create_global(env, 256, MemoryPerms::read_write()).unwrap();
        mem.write(b"hello", 10).unwrap();
        let mut buf = [0u8; 5];
        mem.read(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");

        let mut tail = [0u8; 8];
        assert_eq!(mem.read(&mut tail, 252), Err(Code::InvArgs));
    });
    assert_eq!(code, 0);
}

#[test]
fn test_derivation_never_widens() {
    let platform = boot();
    let code = run_program(&platform, "derive", |env| {
        let mem = MemGate::create_global(env, 256, MemoryPerms::read_write()).unwrap();
        mem.write(&[7u8; 16], 64).unwrap();

        let ro = mem.derive(64, 128, MemoryPerms::read_only()).unwrap();
        let mut buf = [0u8; 16];
        ro.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [7u8; 16]);
        assert_eq!(ro.write(b"no", 0), Err(Code::NoPerm));
        assert_eq!(ro.read(&mut buf, 120), Err(Code::InvArgs));

        // neither more rights nor more room than the parent
        assert_eq!(
            ro.derive(0, 64, MemoryPerms::read_write()).unwrap_err(),
            Code::InvArgs
        );
        assert_eq!(
            ro.derive(64, 128, MemoryPerms::read_only()).unwrap_err(),
            Code::InvArgs
        );
        assert_eq!(
            mem.derive(0, 0, MemoryPerms::read_only()).unwrap_err(),
            Code::InvArgs
        );
        assert_eq!(
            mem.derive(u64::MAX, 2, MemoryPerms::read_only()).unwrap_err(),
            Code::InvArgs
        );

        let narrow = ro.derive(8, 8, MemoryPerms::read_only()).unwrap();
        let mut small = [0u8; 8];
        narrow.read(&mut small, 0).unwrap();
        assert_eq!(small, [7u8; 8]);
    });
    assert_eq!(code, 0);
    assert!(platform.audit(|log| log.has_event(|e| matches!(
        e,
        AuditEvent::Capability(CapabilityEvent::Derived { .. })
    ))));
}

#[test]
fn test_compare_exchange() {
    let platform = boot();
    let code = run_program(&platform, "cmpxchg", |env| {
        let mem = MemGate::create_global(env, 64, MemoryPerms::read_write()).unwrap();
        mem.write(&[1, 2, 3, 4], 0).unwrap();
        assert_eq!(mem.compare_exchange(0, &[1, 2, 3, 4], &[5, 6, 7, 8]), Ok(true));
        assert_eq!(mem.compare_exchange(0, &[1, 2, 3, 4], &[9, 9, 9, 9]), Ok(false));

        let mut buf = [0u8; 4];
        mem.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [5, 6, 7, 8]);

        let ro = mem.derive(0, 4, MemoryPerms::read_only()).unwrap();
        assert_eq!(
            ro.compare_exchange(0, &[5, 6, 7, 8], &[0, 0, 0, 0]),
            Err(Code::NoPerm)
        );
    });
    assert_eq!(code, 0);
}

#[test]
fn test_revoke_is_transitive() {
    let platform = boot();
    let code = run_program(&platform, "revoke", |env| {
        let root = MemGate::create_global(env, 128, MemoryPerms::read_write()).unwrap();
        let child = root.derive(0, 64, MemoryPerms::read_write()).unwrap();
        let grandchild = child.derive(0, 32, MemoryPerms::read_only()).unwrap();
        let mut buf = [0u8; 4];
        grandchild.read(&mut buf, 0).unwrap();

        drop(child);
        assert_eq!(grandchild.read(&mut buf, 0), Err(Code::VpeGone));
        // the root is untouched
        root.write(b"live", 0).unwrap();
    });
    assert_eq!(code, 0);
}

#[test]
fn test_revoke_reaches_into_children() {
    let platform = boot();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (revoked_tx, revoked_rx) = mpsc::channel::<()>();

    let code = run_program(&platform, "parent", move |env| {
        let mem = MemGate::create_global(env, 64, MemoryPerms::read_write()).unwrap();
        mem.write(b"shared", 0).unwrap();

        let vpe = Vpe::new(env, "child").unwrap();
        let sel = vpe.delegate_obj(mem.sel()).unwrap();
        vpe.run(move |env| {
            let mem = MemGate::bind(&env, sel, Ownership::Borrowed);
            let mut buf = [0u8; 6];
            if mem.read(&mut buf, 0).is_err() || &buf != b"shared" {
                return 1;
            }
            let _ = ready_tx.send(());
            if revoked_rx.recv().is_err() {
                return 2;
            }
            match mem.read(&mut buf, 0) {
                Err(Code::VpeGone) => 0,
                _ => 3,
            }
        })
        .unwrap();

        ready_rx.recv().unwrap();
        drop(mem);
        revoked_tx.send(()).unwrap();
        assert_eq!(vpe.wait(), Ok(0));
    });
    assert_eq!(code, 0);
}

#[test]
fn test_selector_in_use() {
    let platform = boot();
    let code = run_program(&platform, "sels", |env| {
        let mem = MemGate::create_global(env, 64, MemoryPerms::read_write()).unwrap();
        let taken = mem.sel();
        assert_eq!(
            env.syscalls()
                .req_mem(taken, None, 64, MemoryPerms::read_write()),
            Err(Code::InvArgs)
        );
        assert_eq!(
            env.syscalls()
                .req_mem(env.alloc_sel(), None, 0, MemoryPerms::read_write()),
            Err(Code::InvArgs)
        );
    });
    assert_eq!(code, 0);
}
