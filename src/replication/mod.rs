//! The high-availability replicator: a master streams its log to one or
//! more slaves over a framed TCP protocol, acknowledgement-tracked and
//! back-pressured through a group-commit gate.

use std::io;

use thiserror::Error;

mod client;
mod frame;
mod gate;
mod server;

pub use client::HAClient;
pub use frame::{FrameAssembler, FRAME_HEADER_LEN, OFFSET_REPORT_LEN};
pub use gate::{GroupCommitRequest, GroupTransferGate};
pub use server::{HAConnectionHandle, HAServer};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The slave's locally replicated log diverged from what the master is
    /// pushing: the slave must be rebuilt from a snapshot, not patched.
    #[error(
        "replication stream diverged: local max_phy_offset={local_offset} but master frame \
         starts at phy_offset={frame_offset}"
    )]
    Diverged {
        local_offset: i64,
        frame_offset: i64,
    },

    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
