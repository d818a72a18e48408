//! Per-VPE environment
//!
//! Everything a program needs to talk to the kernel lives here: its engine,
//! its selector and endpoint allocators, and its work loop. The environment
//! is created once per VPE thread and shared by cloning the handle.

use crate::alloc::{EpAllocator, SelAllocator};
use crate::syscalls::Syscalls;
use crate::workloop::WorkLoop;
use core_types::{CapSel, EpId, Label, PeId, Result, VpeId};
use dtu::Dtu;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Code run on a VPE; the return value is its exit code
pub type Program = Box<dyn FnOnce(Env) -> i32 + Send + 'static>;

/// Starts programs on VPEs the kernel already created
///
/// The platform provides this; a parent uses it to run a closure on a
/// child VPE.
pub trait Loader: Send + Sync {
    /// Runs `program` on `vpe`; its selector allocator starts at `first_sel`
    fn start(&self, vpe: VpeId, first_sel: CapSel, program: Program) -> Result<()>;
}

/// What the platform hands a freshly started VPE
pub struct BootInfo {
    pub vpe: VpeId,
    pub name: String,
    pub dtu: Dtu,
    pub loader: Arc<dyn Loader>,
    /// Selectors below this were filled in by the parent
    pub first_sel: CapSel,
}

impl fmt::Debug for BootInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootInfo")
            .field("vpe", &self.vpe)
            .field("name", &self.name)
            .field("pe", &self.dtu.pe())
            .field("first_sel", &self.first_sel)
            .finish()
    }
}

struct EnvInner {
    vpe: VpeId,
    name: String,
    dtu: Dtu,
    loader: Arc<dyn Loader>,
    sels: RefCell<SelAllocator>,
    eps: RefCell<EpAllocator>,
    workloop: WorkLoop,
    next_label: Cell<Label>,
}

/// Handle to the calling VPE's environment
#[derive(Clone)]
pub struct Env {
    inner: Rc<EnvInner>,
}

impl Env {
    /// Sets up the environment on the VPE's own thread
    pub fn boot(info: BootInfo) -> Self {
        info.dtu.bind_current_thread();
        log::debug!(target: "ipc", "{} '{}' booted on {}", info.vpe, info.name, info.dtu.pe());
        Self {
            inner: Rc::new(EnvInner {
                vpe: info.vpe,
                name: info.name,
                dtu: info.dtu,
                loader: info.loader,
                sels: RefCell::new(SelAllocator::starting_at(info.first_sel)),
                eps: RefCell::new(EpAllocator::new()),
                workloop: WorkLoop::new(),
                next_label: Cell::new(1),
            }),
        }
    }

    pub fn vpe_id(&self) -> VpeId {
        self.inner.vpe
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dtu(&self) -> &Dtu {
        &self.inner.dtu
    }

    /// The PE the VPE runs on right now
    pub fn pe(&self) -> PeId {
        self.inner.dtu.pe()
    }

    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.inner.loader
    }

    /// Kernel calls on behalf of this VPE
    pub fn syscalls(&self) -> Syscalls<'_> {
        Syscalls::new(self)
    }

    pub fn workloop(&self) -> &WorkLoop {
        &self.inner.workloop
    }

    /// Runs the work loop until it has nothing left to do
    pub fn run(&self) -> Result<()> {
        self.inner.workloop.run(self)
    }

    pub fn alloc_sel(&self) -> CapSel {
        self.inner.sels.borrow_mut().alloc()
    }

    /// Allocates `count` contiguous selectors and returns the first
    pub fn alloc_sels(&self, count: u32) -> CapSel {
        self.inner.sels.borrow_mut().alloc_range(count)
    }

    pub fn free_sel(&self, sel: CapSel) {
        self.inner.sels.borrow_mut().free(sel);
    }

    /// Allocates an endpoint, `NoSpace` if all are taken
    pub fn alloc_ep(&self) -> Result<EpId> {
        self.inner.eps.borrow_mut().alloc()
    }

    pub fn free_ep(&self, ep: EpId) {
        self.inner.eps.borrow_mut().free(ep);
    }

    /// Fresh label to match a reply to its request
    pub(crate) fn next_reply_label(&self) -> Label {
        let label = self.inner.next_label.get();
        self.inner.next_label.set(label.wrapping_add(1).max(1));
        label
    }

    /// Tells the kernel the program is done
    ///
    /// Pending work items are dropped first so that the handles they hold
    /// are released while the VPE still exists.
    pub fn exit(&self, code: i32) {
        self.inner.workloop.clear();
        if let Err(code) = self.syscalls().exit(code) {
            log::debug!(target: "ipc", "{}: exit not delivered: {}", self.inner.vpe, code);
        }
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("vpe", &self.inner.vpe)
            .field("name", &self.inner.name)
            .field("pe", &self.pe())
            .finish()
    }
}
