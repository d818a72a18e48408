//! # Gates
//!
//! The process-side half of the capability system: typed handles over
//! kernel objects and the transfer engine.
//!
//! ## Philosophy
//!
//! - **Capabilities are handles**: a gate only wraps a selector; the kernel
//!   decides what it may do
//! - **Lazy binding**: a gate gets an endpoint on first use, and is rebound
//!   once if its peer moved
//! - **Explicit release**: [`Ownership`](core_types::Ownership) says what
//!   dropping a handle does; nothing is revoked behind the caller's back
//! - **One thread per VPE**: handles are `Rc`-shared and never cross threads
//!
//! ## Layout
//!
//! - [`env`]: Per-VPE environment and the program loader seam
//! - [`cap`]: Selector ownership
//! - [`send_gate`], [`recv_gate`], [`mem_gate`]: The three gate kinds
//! - [`syscalls`]: Kernel calls built from a send and a receive gate
//! - [`session`], [`vpe`]: Client sessions and child VPEs
//! - [`workloop`], [`send_queue`]: Cooperative dispatch

pub mod alloc;
pub mod cap;
pub mod env;
mod gate;
pub mod mem_gate;
pub mod recv_gate;
pub mod send_gate;
pub mod send_queue;
pub mod session;
pub mod syscalls;
pub mod vpe;
pub mod workloop;

pub use cap::ObjCap;
pub use env::{BootInfo, Env, Loader, Program};
pub use mem_gate::MemGate;
pub use recv_gate::{GateIStream, RecvBuf, RecvGate};
pub use send_gate::SendGate;
pub use send_queue::SendQueue;
pub use session::Session;
pub use syscalls::Syscalls;
pub use vpe::Vpe;
pub use workloop::{ItemId, WorkItem, WorkLoop};
