//! A cache-coherence directory controller for a discrete-event simulator of a
//! shared-memory multiprocessor.
//!
//! The controller sits between a set of cache agents (the "cpu side") and a
//! backing memory or scratchpad (the "mem side"). It tracks which agents hold
//! each cache line and in what state, and drives the request/response traffic
//! that keeps those agents coherent under a MESI or MSI protocol.
//!
//! The simulator kernel that advances time, the two link endpoints, and the
//! CPU-node subsystem are external: they plug in through [`link::MemLink`] and
//! drive the controller through [`DirectoryController::handle_incoming`] and
//! [`DirectoryController::clock_tick`].

#[macro_use]
extern crate log;

pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod link;
pub mod mshr;
pub mod stats;

pub use config::{Config, Protocol};
pub use directory::DirectoryController;
pub use error::FatalError;
