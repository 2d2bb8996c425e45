//! Hash-by-key index over the commit log.
//!
//! An [`IndexFile`] is a fixed-size memory-mapped file holding a header, a
//! slot array (hash buckets) and an append-only entry array forming
//! singly-linked collision chains. An [`IndexService`] owns an ordered
//! sequence of [`IndexFile`]s, routing writes to the current tail and
//! queries across the whole sequence.

use std::io;

use thiserror::Error;

mod indexfile;
mod service;

pub use indexfile::{IndexFile, IndexFileStats, HEADER_LEN, MAX_KEY_HASH_I32_MIN_COERCED};
pub use service::{BuildIndexOutcome, IndexService};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("index directory {0} could not be opened")]
    InvalidDirectory(String),

    #[error("index file {0} has an invalid header or truncated layout")]
    InvalidFormat(String),

    #[error("broker index is unwritable: rollover retries exhausted")]
    Unwritable,
}

pub type Result<T> = std::result::Result<T, IndexError>;
