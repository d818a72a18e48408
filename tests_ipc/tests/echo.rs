//! End-to-end requests to the echo service

use core_types::Code;
use ipc::OStream;
use kernel_api::{ServiceCmd, Syscall};
use services_echo::{EchoClient, EchoOp, SERVICE_NAME};
use sim_kernel::AuditEvent;
use tests_ipc::{boot, run_program, spawn_echo_server, stop_server};

#[test]
fn test_reverse_round_trip() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "client", |env| {
        let client = EchoClient::connect(env, SERVICE_NAME).unwrap();
        assert_eq!(client.gate().credits(), Ok(Some(1)));
        assert_eq!(client.reverse("123456").unwrap(), "654321");
        assert_eq!(client.echo("123456").unwrap(), "123456");
        assert_eq!(client.count().unwrap(), 2);
    });
    assert_eq!(code, 0);
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_hundred_requests_leak_no_credit() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "client", |env| {
        let client = EchoClient::connect(env, SERVICE_NAME).unwrap();
        for _ in 0..100 {
            assert_eq!(client.reverse("123456").unwrap(), "654321");
            assert_eq!(client.gate().credits(), Ok(Some(1)));
        }
        assert_eq!(client.count().unwrap(), 100);
    });
    assert_eq!(code, 0);
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_out_of_range_op_keeps_session_usable() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "client", |env| {
        let client = EchoClient::connect(env, SERVICE_NAME).unwrap();
        let err = client
            .gate()
            .call(OStream::new().push(&(EchoOp::COUNT as u64)))
            .unwrap_err();
        assert_eq!(err, Code::InvArgs);
        assert_eq!(
            client.gate().call(OStream::new().push(&u64::MAX)).unwrap_err(),
            Code::InvArgs
        );
        // missing argument
        assert_eq!(
            client
                .gate()
                .call(OStream::new().push(&u64::from(EchoOp::Reverse)))
                .unwrap_err(),
            Code::InvArgs
        );
        assert_eq!(client.reverse("abc").unwrap(), "cba");
        assert_eq!(client.gate().credits(), Ok(Some(1)));
    });
    assert_eq!(code, 0);
    assert_eq!(stop_server(&platform, server), Some(0));
}

#[test]
fn test_two_clients_have_separate_sessions() {
    let platform = boot();
    let server = spawn_echo_server(&platform);

    let code = run_program(&platform, "clients", |env| {
        let a = EchoClient::connect(env, SERVICE_NAME).unwrap();
        let b = EchoClient::connect(env, SERVICE_NAME).unwrap();
        a.reverse("ab").unwrap();
        a.reverse("cd").unwrap();
        b.echo("ef").unwrap();
        assert_eq!(a.count().unwrap(), 2);
        assert_eq!(b.count().unwrap(), 1);
    });
    assert_eq!(code, 0);

    let opened = platform.audit(|log| {
        log.count_events(|e| {
            matches!(
                e,
                AuditEvent::ServiceCall {
                    cmd: ServiceCmd::Open,
                    code: 0,
                    ..
                }
            )
        })
    });
    assert_eq!(opened, 2);
    assert_eq!(stop_server(&platform, server), Some(0));
    assert!(platform.service_names().is_empty());
}

#[test]
fn test_syscalls_are_audited() {
    let platform = boot();
    let server = spawn_echo_server(&platform);
    let handle = platform
        .spawn("client", |env| {
            let client = EchoClient::connect(&env, SERVICE_NAME).unwrap();
            client.reverse("x").unwrap();
            0
        })
        .unwrap();
    let client = handle.id();
    assert_eq!(handle.join().unwrap(), 0);

    platform.audit(|log| {
        assert_eq!(log.count_syscalls(client, Syscall::CreateSess), 1);
        assert_eq!(log.count_syscalls(client, Syscall::Obtain), 1);
    });
    assert_eq!(stop_server(&platform, server), Some(0));
}
