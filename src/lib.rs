//! devoured: a lightweight service supervisor
//!
//! The library exposes the reactor, wire protocol, and process
//! supervision layers so integration tests and tooling can drive them
//! directly; the `devoured` binary is a thin mode switch over
//! [`daemon::Daemon`] and [`daemon::ControlClient`].

pub mod config;
pub mod daemon;
pub mod error;
pub mod net;
pub mod process;
pub mod protocol;
pub mod reactor;
pub mod service;
pub mod signal;
