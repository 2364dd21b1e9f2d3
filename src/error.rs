//! Fatal error reporting.
//!
//! NACK is the only recoverable failure and it travels on the wire; everything
//! else aborts the simulation deterministically. Errors carry enough context
//! (command, state, address, endpoint names) that a failed run can be replayed
//! to the same point and diagnosed.

use crate::directory::dir_entry::State;
use crate::event::{Command, EventId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FatalError {
    #[error("protocol violation: received {cmd:?} for 0x{addr:x} in state {state:?} (src {src})")]
    Protocol { cmd: Command, state: State, addr: u64, src: String },

    #[error("no link can reach destination '{dst}' (routing address 0x{addr:x})")]
    Routing { dst: String, addr: u64 },

    #[error("received {cmd:?} response {id:?} that matches no outstanding request")]
    OrphanResponse { cmd: Command, id: EventId },

    #[error("request address 0x{addr:x} is outside the directory's region")]
    InvalidAddress { addr: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FatalError>;
