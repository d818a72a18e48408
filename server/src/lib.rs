//! # Server
//!
//! Named services on top of gates.
//!
//! ## Philosophy
//!
//! - **Kernel-brokered**: clients never reach a server directly; the kernel
//!   asks the server to open sessions and to hand out capabilities
//! - **Explicit protocol**: every request starts with an operation tag that
//!   is looked up in a bounds-checked table
//! - **Single-threaded**: a server is a set of work items on its VPE's loop
//!
//! ## Layout
//!
//! - [`config`]: Buffer sizes
//! - [`handler`]: The [`Handler`] trait and the per-call [`Context`]
//! - [`server`]: Service registration and control dispatch
//! - [`ops`]: Operation tables
//! - [`request`]: Request/reply services
//! - [`event`]: Services that push events to their clients

pub mod config;
pub mod event;
pub mod handler;
pub mod ops;
pub mod request;
pub mod server;

pub use config::{ServerConfig, MAX_RECVBUFS};
pub use event::{EventHandler, EventSession};
pub use handler::{Context, Exchange, Handler, SessionData};
pub use ops::{Operation, OperationTable};
pub use request::RequestHandler;
pub use server::Server;
