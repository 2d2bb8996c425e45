//! The external collaborators this crate treats abstractly: the commit log
//! itself and its checkpoint store.
//!
//! Production brokers own a durable, segmented commit log; this module only
//! specifies the boundary the index and replicator consume
//! (`max_physical_offset`, `append`, a ranged read, and a durable
//! `index_msg_timestamp`) and ships a flat in-memory implementation of it,
//! grounded on the teacher commitlog crate's `repo::Memory` backend, so the
//! rest of this crate can be built, tested and demonstrated without a real
//! broker. It is not a durable log.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// The type of a dispatched log message, as seen by the index builder.
///
/// Transactional `Commit`/`Rollback` markers carry no keys of their own --
/// the prepared message they finalize already indexed them -- so
/// [`crate::index::IndexService::build_index`] skips them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Normal,
    TransactionCommit,
    TransactionRollback,
}

/// One dispatched message, handed from the log's dispatch loop to the index
/// builder.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub topic: String,
    /// Raw user keys, space-separated; empty segments are ignored.
    pub keys: String,
    pub commit_log_offset: i64,
    pub store_timestamp: i64,
    pub msg_type: MessageType,
}

/// The append-only commit log boundary.
///
/// `append` and `read_slice` deal in physical byte offsets; offsets returned
/// by one call are stable inputs to the other. A concrete broker
/// implementation is a durable, segmented log -- out of scope for this
/// crate (see the specification).
pub trait Log: Send + Sync {
    /// Highest physical offset appended so far, or `0` for an empty log.
    fn max_physical_offset(&self) -> i64;

    /// Append `bytes` at `offset`, the log's current `max_physical_offset`.
    fn append(&self, offset: i64, bytes: &[u8]) -> io::Result<()>;

    /// Read up to `max_bytes` contiguous bytes starting at `start_offset`.
    ///
    /// The returned slice begins on a message boundary; it may be shorter
    /// than `max_bytes` if fewer bytes are available.
    fn read_slice(&self, start_offset: i64, max_bytes: usize) -> io::Result<Vec<u8>>;
}

/// Durable single-field checkpoint consulted on recovery.
pub trait CheckpointStore: Send + Sync {
    /// Timestamp (ms) of the last message the index is known to have
    /// durably indexed.
    fn index_msg_timestamp(&self) -> i64;

    /// Record `ts` as the new checkpoint.
    fn set_index_msg_timestamp(&self, ts: i64);
}

/// An in-memory [`Log`], backed by a single growable buffer behind a lock --
/// the same role as the teacher's `repo::Memory::Segment`, adapted to this
/// spec's flat-byte-log model rather than the teacher's segmented-commit
/// model. Intended for tests and the demo binary, not production use.
#[derive(Clone, Default)]
pub struct InMemoryLog {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Log for InMemoryLog {
    fn max_physical_offset(&self) -> i64 {
        self.buf.read().len() as i64
    }

    fn append(&self, offset: i64, bytes: &[u8]) -> io::Result<()> {
        let mut buf = self.buf.write();
        if offset as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "non-contiguous append: offset={offset} but log length={}",
                    buf.len()
                ),
            ));
        }
        buf.extend_from_slice(bytes);
        Ok(())
    }

    fn read_slice(&self, start_offset: i64, max_bytes: usize) -> io::Result<Vec<u8>> {
        let buf = self.buf.read();
        let start = start_offset as usize;
        if start > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end of log: start={start} len={}", buf.len()),
            ));
        }
        let end = (start + max_bytes).min(buf.len());
        Ok(buf[start..end].to_vec())
    }
}

/// An in-memory [`CheckpointStore`]. Not durable; for tests and the demo.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    index_msg_timestamp: AtomicI64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn index_msg_timestamp(&self) -> i64 {
        self.index_msg_timestamp.load(Ordering::Acquire)
    }

    fn set_index_msg_timestamp(&self, ts: i64) {
        self.index_msg_timestamp.store(ts, Ordering::Release);
    }
}
