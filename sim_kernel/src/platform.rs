//! Booting the simulated machine
//!
//! [`Platform::boot`] brings up the fabric, the kernel PE and the kernel
//! thread. Programs are closures: [`Platform::spawn`] runs one as a new
//! root VPE, and VPEs start children through the [`Loader`] the platform
//! hands them.

use crate::capability_audit::CapabilityAuditLog;
use crate::config::KernelConfig;
use crate::error::PlatformError;
use crate::kernel::{self, lock, Kernel};
use core_types::{CapSel, Code, Result, VpeId};
use dtu::{Dtu, Fabric};
use gates::{BootInfo, Env, Loader, Program};
use kernel_api::FIRST_FREE_SEL;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

/// Runs `program` as the VPE described by `info` and reports its exit
///
/// A panicking program exits with -1.
pub(crate) fn run_program(info: BootInfo, program: Program) -> i32 {
    let vpe = info.vpe;
    let env = Env::boot(info);
    let code = match panic::catch_unwind(AssertUnwindSafe(|| program(env.clone()))) {
        Ok(code) => code,
        Err(_) => {
            log::warn!(target: "sysc", "{} panicked", vpe);
            -1
        }
    };
    env.exit(code);
    code
}

/// Starts programs on VPEs created through `CreateVpe`
struct KernelLoader {
    kernel: Weak<Mutex<Kernel>>,
}

impl Loader for KernelLoader {
    fn start(&self, vpe: VpeId, first_sel: CapSel, program: Program) -> Result<()> {
        let kernel = self.kernel.upgrade().ok_or(Code::VpeGone)?;
        let mut kernel = lock(&kernel);
        kernel.load(vpe, first_sel, program)
    }
}

/// A root VPE started by [`Platform::spawn`]
#[derive(Debug)]
pub struct VpeHandle {
    id: VpeId,
    thread: JoinHandle<i32>,
}

impl VpeHandle {
    pub fn id(&self) -> VpeId {
        self.id
    }

    /// Waits for the program to return and yields its exit code
    pub fn join(self) -> std::result::Result<i32, PlatformError> {
        self.thread.join().map_err(|_| PlatformError::Panicked(self.id))
    }
}

/// The booted machine
pub struct Platform {
    kernel: Arc<Mutex<Kernel>>,
    fabric: Arc<Fabric>,
    config: KernelConfig,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Platform {
    /// Brings up the fabric and the kernel
    pub fn boot(config: KernelConfig) -> std::result::Result<Self, PlatformError> {
        config.validate()?;
        let fabric = Fabric::new(config.dtu.clone());
        let dtu = fabric.create_pe()?;
        Kernel::setup_eps(&fabric, &dtu, &config)?;

        let kernel = Arc::new_cyclic(|weak: &Weak<Mutex<Kernel>>| {
            let loader: Arc<dyn Loader> = Arc::new(KernelLoader {
                kernel: weak.clone(),
            });
            Mutex::new(Kernel::new(config.clone(), fabric.clone(), dtu.clone(), loader))
        });
        Self::start(kernel, fabric, dtu, config)
    }

    fn start(
        kernel: Arc<Mutex<Kernel>>,
        fabric: Arc<Fabric>,
        dtu: Dtu,
        config: KernelConfig,
    ) -> std::result::Result<Self, PlatformError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let kernel = kernel.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("kernel".into())
                .spawn(move || kernel::run(kernel, dtu, stop))?
        };
        log::info!(target: "sysc", "platform up with {} PEs", config.dtu.max_pes);
        Ok(Self {
            kernel,
            fabric,
            config,
            stop,
            thread: Some(thread),
        })
    }

    /// Runs `program` as a new VPE without parent
    pub fn spawn<F>(&self, name: &str, program: F) -> std::result::Result<VpeHandle, PlatformError>
    where
        F: FnOnce(Env) -> i32 + Send + 'static,
    {
        let info = {
            let mut kernel = lock(&self.kernel);
            let id = kernel.create_vpe(name, None)?;
            kernel.mark_running(id)?;
            kernel.boot_info(id, FIRST_FREE_SEL)?
        };
        let id = info.vpe;
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_program(info, Box::new(program)));
        match thread {
            Ok(thread) => Ok(VpeHandle { id, thread }),
            Err(err) => {
                lock(&self.kernel).terminate(id, -1);
                Err(PlatformError::Spawn(err))
            }
        }
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Runs `f` on the kernel's audit trail
    pub fn audit<R>(&self, f: impl FnOnce(&CapabilityAuditLog) -> R) -> R {
        f(lock(&self.kernel).audit())
    }

    pub fn clear_audit(&self) {
        lock(&self.kernel).audit_mut().clear();
    }

    /// Names of the registered services, sorted
    pub fn service_names(&self) -> Vec<String> {
        lock(&self.kernel).service_names()
    }

    /// VPEs that did not exit yet
    pub fn vpe_count(&self) -> usize {
        lock(&self.kernel).vpe_count()
    }

    /// Exit code of `vpe`, once it exited
    pub fn exit_code(&self, vpe: VpeId) -> Option<i32> {
        lock(&self.kernel).exit_code(vpe)
    }

    /// Asks every service to shut down
    pub fn shutdown_services(&self) {
        lock(&self.kernel).shutdown_services();
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("max_pes", &self.config.dtu.max_pes)
            .field("pes", &self.fabric.pe_count())
            .finish()
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::warn!(target: "sysc", "kernel thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{small_config, wait_until};
    use std::time::Duration;

    #[test]
    fn test_spawn_and_exit() {
        let platform = Platform::boot(small_config()).unwrap();
        let handle = platform.spawn("seven", |_env| 7).unwrap();
        let id = handle.id();
        assert_eq!(handle.join().unwrap(), 7);
        assert!(wait_until(Duration::from_secs(5), || {
            platform.exit_code(id) == Some(7)
        }));
        assert_eq!(platform.vpe_count(), 0);
    }

    #[test]
    fn test_panicking_program_exits_with_minus_one() {
        let platform = Platform::boot(small_config()).unwrap();
        let handle = platform.spawn("boom", |_env| panic!("boom")).unwrap();
        assert_eq!(handle.join().unwrap(), -1);
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        let mut config = small_config();
        config.dtu.max_pes = 1;
        assert!(matches!(
            Platform::boot(config),
            Err(PlatformError::Config(_))
        ));
    }
}
