//! # Kernel API
//!
//! The wire contract between VPEs, the kernel and services.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Capability creation, derivation, exchange and revocation
//! - Endpoint activation (binding a capability to hardware)
//! - Service registration and session brokering
//!
//! Every call is one message: an operation tag followed by a fixed
//! argument record. Decoding produces a closed sum type, so the receiver
//! matches over the operation set instead of indexing a table.
//!
//! ## Layout
//!
//! - [`abi`]: Reserved endpoints, selectors and buffer sizes
//! - [`syscalls`]: VPE → kernel requests
//! - [`service`]: Kernel → service requests

pub mod abi;
pub mod service;
pub mod syscalls;

pub use abi::*;
pub use service::{ServiceCmd, ServiceRequest};
pub use syscalls::{Syscall, SyscallRequest, VpeOp};
