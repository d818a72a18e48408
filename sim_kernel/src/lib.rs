//! # Simulated Kernel
//!
//! This crate boots a whole machine in one process: a [`dtu::Fabric`] with
//! one PE per VPE, and a kernel thread on PE 0 that answers system calls,
//! keeps the capability tables and talks to services on behalf of clients.
//!
//! ## Philosophy
//!
//! **The kernel owns every capability, applications only own selectors.**
//!
//! Applications never touch kernel objects. They name them by selector in
//! a syscall, the kernel checks the selector against the caller's table
//! and configures endpoints through the DTU. Revocation walks the
//! derivation tree, so handing out a capability never loses track of it.
//!
//! Everything is inspectable: the [`CapabilityAuditLog`] records each
//! capability change, syscall and service call for tests to assert on.
//!
//! ## Layout
//!
//! - [`platform`]: booting, spawning programs, shutting down
//! - [`kernel`]: kernel state, VPE lifecycle, service calls
//! - [`cap_table`]: per-VPE capability tables and the derivation tree
//! - [`services`], [`pending`], [`vpes`]: bookkeeping the kernel keeps
//! - [`memory`]: global memory allocation
//! - [`capability_audit`]: the audit trail

pub mod cap_table;
pub mod capability_audit;
pub mod config;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod pending;
pub mod platform;
pub mod services;
mod syscall_handler;
pub mod test_utils;
pub mod vpes;

pub use capability_audit::{AuditEvent, CapabilityAuditLog};
pub use config::KernelConfig;
pub use error::PlatformError;
pub use kernel::Kernel;
pub use platform::{Platform, VpeHandle};
