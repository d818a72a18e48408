//! Session lifecycle and service registration

use core_types::{CapabilityEvent, Code};
use gates::{GateIStream, SendGate, Session, Vpe};
use ipc::OStream;
use kernel_api::{ServiceCmd, Syscall};
use server::{OperationTable, RequestHandler, Server, ServerConfig};
use services_echo::{EchoClient, EchoOp, SERVICE_NAME};
use sim_kernel::AuditEvent;
use std::sync::mpsc;
use tests_ipc::{boot, run_program, spawn_echo_server, stop_server, wait_for, WAIT};

fn closed_sessions(platform: &sim_kernel::Platform) -> usize {
    platform.audit(|log| {
        log.count_events(|e| {
            matches!(
                e,
                AuditEvent::ServiceCall {
                    cmd: ServiceCmd::Close,
                    code: 0,
                    ..
                }
            )
        })
    })
}

#[test]
fn test_second_obtain_is_refused() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "client", |env| {
        let sess = Session::open(env, SERVICE_NAME, OStream::new()).unwrap();
        // one gate per session, and only one at a time
        assert_eq!(sess.obtain(2, OStream::new()).unwrap_err(), Code::InvArgs);
        let gate = sess.connect(OStream::new()).unwrap();
        assert_eq!(sess.connect(OStream::new()).unwrap_err(), Code::InvArgs);
        assert_eq!(gate.credits(), Ok(Some(1)));
    });
    assert_eq!(code, 0);
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_delegate_is_not_supported_by_echo() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "client", |env| {
        let sess = Session::open(env, SERVICE_NAME, OStream::new()).unwrap();
        let caps = core_types::CapRange::single(kernel_api::SEL_MEM);
        assert_eq!(
            sess.delegate(caps, OStream::new()).unwrap_err(),
            Code::NotSup
        );
    });
    assert_eq!(code, 0);
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_close_reaches_the_server() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "client", |env| {
        let sess = Session::open(env, SERVICE_NAME, OStream::new()).unwrap();
        let gate = sess.connect(OStream::new()).unwrap();
        let mut reply = gate.call(OStream::new().push(&0u64).push("abc")).unwrap();
        assert_eq!(reply.pop::<String>().unwrap(), "cba");
        drop(reply);
        sess.close().unwrap();

        // the session's gate went with it
        let err = gate
            .call(OStream::new().push(&0u64).push("abc"))
            .unwrap_err();
        assert!(err.is_peer_lifetime(), "unexpected {err}");
    });
    assert_eq!(code, 0);
    assert_eq!(closed_sessions(&platform), 1);
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_exit_closes_open_sessions() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let handle = platform
        .spawn("leaky", |env| {
            let sess = Session::open(&env, SERVICE_NAME, OStream::new()).unwrap();
            // the kernel cleans up after the VPE
            std::mem::forget(sess);
            0
        })
        .unwrap();
    assert_eq!(handle.join().unwrap(), 0);
    assert!(tests_ipc::wait_for(|| closed_sessions(&platform) == 1));
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_unknown_service() {
    let platform = boot();
    let code = run_program(&platform, "client", |env| {
        assert_eq!(
            Session::open(env, "nobody", OStream::new()).unwrap_err(),
            Code::InvArgs
        );
    });
    assert_eq!(code, 0);
}

#[test]
fn test_duplicate_name_fails_with_exists() {
    let platform = boot();
    let code = run_program(&platform, "services", |env| {
        let first =
            services_echo::register(env, "dup", 1, ServerConfig::default()).unwrap();
        let second = services_echo::register(env, "dup", 1, ServerConfig::default());
        assert_eq!(second.err(), Some(Code::Exists));
        assert_eq!(first.name(), "dup");
    });
    assert_eq!(code, 0);

    platform.audit(|log| {
        assert!(log.has_event(|e| matches!(
            e,
            AuditEvent::Syscall {
                op: Syscall::CreateSrv,
                code,
                ..
            } if *code == Code::Exists.raw()
        )));
    });
    assert!(platform.service_names().is_empty());
}

#[test]
fn test_revoking_service_revokes_sessions() {
    let platform = boot();
    let server = spawn_echo_server(&platform);
    let server_id = server.id();

    let (tx, rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let client = platform
        .spawn("client", move |env| {
            let client = services_echo::EchoClient::connect(&env, SERVICE_NAME).unwrap();
            assert_eq!(client.reverse("ab").unwrap(), "ba");
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
            // server is gone, and so is the session gate
            let err = client.reverse("ab").unwrap_err();
            assert!(err.is_peer_lifetime(), "unexpected {err}");
            0
        })
        .unwrap();

    rx.recv().unwrap();
    assert_eq!(stop_server(&platform, server), Some(0));
    assert_eq!(platform.exit_code(server_id), Some(0));
    assert!(platform.audit(|log| log.has_event(|e| matches!(
        e,
        AuditEvent::Capability(CapabilityEvent::ServiceRemoved { .. })
    ))));
    done_tx.send(()).unwrap();
    assert_eq!(client.join().unwrap(), 0);
}

#[test]
fn test_request_on_opened_session_is_refused() {
    let platform = boot();
    let code = run_program(&platform, "client", |env| {
        let vpe = Vpe::new(env, "echo-server").unwrap();
        let (tx, rx) = mpsc::channel();
        vpe.run(move |env| {
            let Ok(server) = services_echo::register(&env, "unbound", 1, ServerConfig::default())
            else {
                return 1;
            };
            // opened, but no gate obtained
            let Ok((ident, _)) = server.own_session(OStream::new()) else {
                return 2;
            };
            if tx.send((ident, server.buf_eps())).is_err() {
                return 3;
            }
            match server.run() {
                Ok(()) => 0,
                Err(_) => 4,
            }
        })
        .unwrap();
        let (ident, eps) = rx.recv_timeout(WAIT).unwrap();

        let sgate = SendGate::create_for(env, vpe.sel(), eps[0], ident, 1).unwrap();
        let request = || {
            OStream::new()
                .push(&u64::from(EchoOp::Reverse))
                .push("123456")
        };
        assert_eq!(sgate.call(request()).unwrap_err(), Code::InvArgs);
        assert_eq!(sgate.credits(), Ok(Some(1)));
        assert_eq!(sgate.call(request()).unwrap_err(), Code::InvArgs);

        // the service keeps answering bound sessions
        let client = EchoClient::connect(env, "unbound").unwrap();
        assert_eq!(client.reverse("123456").unwrap(), "654321");
        drop(client);
        vpe.stop().unwrap();
    });
    assert_eq!(code, 0);
}

fn ignore(_sess: &mut (), _msg: &mut GateIStream) -> core_types::Result<()> {
    Ok(())
}

#[test]
fn test_unanswered_request_returns_the_credit() {
    let platform = boot();
    let server = platform
        .spawn("silent-server", |env| {
            let handler = OperationTable::<()>::new(1)
                .with(0, ignore)
                .map(|ops| RequestHandler::new(ops, |_, _| Ok(())));
            match handler
                .and_then(|h| Server::new(&env, "silent", h))
                .and_then(|s| s.run())
            {
                Ok(()) => 0,
                Err(_) => 1,
            }
        })
        .unwrap();
    assert!(wait_for(|| platform.service_names().iter().any(|n| n == "silent")));

    let code = run_program(&platform, "client", |env| {
        let sess = Session::open(env, "silent", OStream::new()).unwrap();
        let gate = sess.connect(OStream::new()).unwrap();
        for _ in 0..3 {
            gate.call(OStream::new().push(&0u64)).unwrap();
            assert_eq!(gate.credits(), Ok(Some(1)));
        }
    });
    assert_eq!(code, 0);
    assert_eq!(stop_server(&platform, server), Some(0));
}
