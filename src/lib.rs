//! A hash-by-key index over a commit log's physical offsets, and a
//! master/slave high-availability replicator gating producers on
//! group-commit acknowledgement.
//!
//! See the `index` and `replication` modules for the two halves; `log`
//! defines the commit-log boundary both consume, and `config` gathers their
//! tunables into one explicitly-constructed value.

pub mod config;
pub mod index;
pub mod log;
pub mod replication;

pub use config::BrokerHaConfig;
pub use index::{IndexError, IndexFile, IndexService};
pub use log::{CheckpointStore, DispatchRequest, Log, MessageType};
pub use replication::{HAClient, HAServer, ReplicationError};
