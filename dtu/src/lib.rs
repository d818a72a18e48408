//! # Transfer Engine Emulation
//!
//! A software model of the data transfer unit (DTU) that connects
//! processing elements. Every PE owns a set of endpoint registers and an
//! engine thread; applications talk to their engine through a command
//! register, and engines talk to each other through the [`Fabric`].
//!
//! ## Philosophy
//!
//! - **Registers, not locks**: endpoint registers, receive slots and the
//!   command register are atomics with acquire/release ordering. The
//!   application and its engine never compete for the same field.
//! - **Kernel writes, everyone reads**: only the kernel configures
//!   endpoints; a sequence counter gives readers consistent snapshots.
//! - **Errors are codes**: a vanished PE is `VpeGone`, a vanished receive
//!   endpoint is `RecvGone`, an unconfigured endpoint is `EpInvalid`.
//!
//! ## Key Types
//!
//! - [`Dtu`]: The application-side handle of one PE's engine
//! - [`Fabric`]: The interconnect routing messages between PEs
//! - [`EpConfig`]: What the kernel writes into an endpoint
//! - [`RingBuffer`]: The slot array behind a receive endpoint

mod engine;
pub mod endpoint;
pub mod fabric;
pub mod memory;
pub mod ringbuf;

mod dtu;

pub use dtu::Dtu;
pub use endpoint::{EpConfig, MemConfig, RecvConfig, SendConfig};
pub use fabric::{DtuConfig, Fabric};
pub use memory::MainMemory;
pub use ringbuf::{Fetched, RingBuffer};

/// Endpoint register sets per PE
pub const EP_COUNT: usize = 16;

/// Upper bound of slots in one receive buffer
pub const MAX_MSG_SLOTS: usize = 32;

/// Credit limit of send endpoints that never run out
pub const UNLIMITED_CREDITS: u32 = u32::MAX;
