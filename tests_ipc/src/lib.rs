//! IPC Test Utilities
//!
//! Shared bootstrap for the cross-crate scenarios in `tests/`.
//!
//! ## Test Philosophy
//!
//! - **Real threads, bounded waits**: every scenario boots a platform and
//!   runs programs on VPE threads; nothing waits without a deadline
//! - **Assertions inside programs**: a failed assertion panics the program,
//!   which then exits with -1 and fails the test
//! - **Audit trail**: what happened in the kernel is checked afterwards
//!   through the capability audit log

use gates::{Env, RecvBuf};
use services_echo::SERVICE_NAME;
use sim_kernel::test_utils::wait_until;
use sim_kernel::{KernelConfig, Platform, VpeHandle};
use std::time::Duration;

/// Upper bound for anything a test waits for
pub const WAIT: Duration = Duration::from_secs(10);

/// Machine used by the scenarios
pub fn config() -> KernelConfig {
    let mut config = sim_kernel::test_utils::small_config();
    config.dtu.mem_size = 256 * 1024;
    config
}

/// Boots a platform with [`config`]
pub fn boot() -> Platform {
    Platform::boot(config()).expect("platform boots")
}

/// Runs `body` as a root VPE and returns its exit code
///
/// The code is 0 unless `body` panicked.
pub fn run_program<F>(platform: &Platform, name: &str, body: F) -> i32
where
    F: FnOnce(&Env) + Send + 'static,
{
    let handle = platform
        .spawn(name, move |env| {
            body(&env);
            0
        })
        .expect("program spawns");
    handle.join().expect("program thread joins")
}

/// Starts the echo service and waits until its name is registered
pub fn spawn_echo_server(platform: &Platform) -> VpeHandle {
    let handle = platform
        .spawn("echo-server", |env| match services_echo::serve(&env) {
            Ok(()) => 0,
            Err(code) => {
                log::warn!(target: "serv", "echo service failed: {}", code);
                1
            }
        })
        .expect("server spawns");
    assert!(
        wait_until(WAIT, || platform
            .service_names()
            .iter()
            .any(|n| n == SERVICE_NAME)),
        "echo service did not register"
    );
    handle
}

/// Shuts all services down and returns the exit code of `server`
pub fn stop_server(platform: &Platform, server: VpeHandle) -> Option<i32> {
    let id = server.id();
    platform.shutdown_services();
    if wait_until(WAIT, || platform.exit_code(id).is_some()) {
        server.join().ok()
    } else {
        None
    }
}

/// Drops the replies that piled up in the default reply buffer
pub fn drain_replies(env: &Env) -> usize {
    let buf = RecvBuf::def(env);
    let mut count = 0;
    while buf.fetch().is_some() {
        count += 1;
    }
    count
}

/// Polls `predicate` for at most [`WAIT`]
pub fn wait_for(predicate: impl FnMut() -> bool) -> bool {
    wait_until(WAIT, predicate)
}
