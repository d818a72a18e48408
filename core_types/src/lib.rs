//! # Core Types
//!
//! This crate defines the fundamental types shared by every layer of the
//! capability-secured IPC substrate.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: a selector names exactly one kernel object,
//!   and who cleans it up is spelled out by an [`Ownership`] variant.
//! - **Codes, not panics**: every failure is a [`Code`] that travels over the
//!   wire unchanged and is returned to the caller.
//! - **No ambient authority**: all remote access goes through a capability.
//!
//! ## Key Types
//!
//! - [`CapSel`]: Process-local capability selector
//! - [`VpeId`] / [`PeId`]: Execution context and processing element ids
//! - [`CapRange`]: Contiguous selector range used by exchanges
//! - [`Ownership`]: Release behaviour of a capability handle
//! - [`MemoryPerms`]: Permission mask of memory capabilities
//! - [`Code`]: Error codes surfaced to callers

pub mod capability;
pub mod error;
pub mod ids;
pub mod memory;

pub use capability::{CapKind, CapRange, CapabilityEvent, Ownership};
pub use error::{Code, Result};
pub use ids::{CapSel, EpId, Label, PeId, ServiceId, VpeId, INVALID_SEL};
pub use memory::MemoryPerms;
