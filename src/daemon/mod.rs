//! Daemon runtime and control-plane client
//!
//! The server side is the event-driven dispatcher that owns the control
//! socket, the connection table, and the service table. The client side
//! is the thin request/response tool the CLI uses to talk to it.

pub mod client;
pub mod server;

pub use client::ControlClient;
pub use server::Daemon;
