//! The group-commit gate: producers block until a target offset has been
//! replicated to at least one slave.
//!
//! Per Design Note 9, the two-list swap pattern is implemented as two
//! `Vec`s guarded by a `parking_lot::Mutex`, swapped with `mem::take` under
//! the lock, with a `tokio::sync::Notify` waking the service task in place
//! of a condition variable.

use std::mem;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::config::BrokerHaConfig;

/// A producer's pending wait for `next_offset` to be replicated.
pub struct GroupCommitRequest {
    next_offset: i64,
    tx: oneshot::Sender<bool>,
    rounds_left: u32,
}

/// Blocks producers on `wait_for` until [`Self::notify_transfer_some`]
/// reports that `push2slave_max_offset` has caught up, or until the
/// configured number of wait rounds is exhausted.
pub struct GroupTransferGate {
    push2slave_max_offset: Arc<AtomicI64>,
    write_list: Mutex<Vec<GroupCommitRequest>>,
    notify: Notify,
    wait_rounds: u32,
    wait_interval: Duration,
}

impl GroupTransferGate {
    pub fn new(push2slave_max_offset: Arc<AtomicI64>, config: &BrokerHaConfig) -> Arc<Self> {
        Arc::new(Self {
            push2slave_max_offset,
            write_list: Mutex::new(Vec::new()),
            notify: Notify::new(),
            wait_rounds: config.group_commit_wait_rounds,
            wait_interval: Duration::from_millis(config.group_commit_wait_interval_ms),
        })
    }

    pub fn push2slave_max_offset(&self) -> i64 {
        self.push2slave_max_offset.load(Ordering::Acquire)
    }

    /// Monotonically bump `push2slave_max_offset` (CAS retry on races with
    /// other connections reporting concurrently) and wake the gate.
    pub fn notify_transfer_some(&self, offset: i64) {
        let mut current = self.push2slave_max_offset.load(Ordering::Acquire);
        while offset > current {
            match self.push2slave_max_offset.compare_exchange_weak(
                current,
                offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.notify.notify_one();
    }

    /// Block until `push2slave_max_offset >= next_offset`, or until the
    /// configured number of wait rounds elapses, whichever comes first.
    pub async fn wait_for(&self, next_offset: i64) -> bool {
        if self.push2slave_max_offset() >= next_offset {
            return true;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut write_list = self.write_list.lock();
            write_list.push(GroupCommitRequest {
                next_offset,
                tx,
                rounds_left: self.wait_rounds,
            });
        }
        self.notify.notify_one();
        rx.await.unwrap_or(false)
    }

    /// Drive the gate: swap the write list into a service-owned read list,
    /// check each pending request against the current offset, and resolve
    /// requests that are satisfied or have exhausted their wait rounds.
    ///
    /// Intended to be driven from a loop woken by either `notify` or a
    /// `wait_interval` tick; see [`crate::replication::HAServer::run`].
    pub fn drive(&self, read_list: &mut Vec<GroupCommitRequest>) {
        {
            let mut write_list = self.write_list.lock();
            read_list.append(&mut mem::take(&mut *write_list));
        }
        let current = self.push2slave_max_offset();
        read_list.retain_mut(|req| {
            if current >= req.next_offset {
                let tx = take_tx(req);
                let _ = tx.send(true);
                return false;
            }
            if req.rounds_left == 0 {
                let tx = take_tx(req);
                let _ = tx.send(false);
                return false;
            }
            req.rounds_left -= 1;
            true
        });
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn wait_interval(&self) -> Duration {
        self.wait_interval
    }

    /// Fail every pending request, e.g. on shutdown.
    pub fn shutdown(&self, read_list: &mut Vec<GroupCommitRequest>) {
        let mut write_list = self.write_list.lock();
        for req in read_list.drain(..).chain(write_list.drain(..)) {
            let _ = req.tx.send(false);
        }
    }
}

/// `retain_mut`'s closure can't move out of `&mut GroupCommitRequest`, so
/// swap the sender out behind a dummy replacement just long enough to send.
fn take_tx(req: &mut GroupCommitRequest) -> oneshot::Sender<bool> {
    let (dummy_tx, _dummy_rx) = oneshot::channel();
    mem::replace(&mut req.tx, dummy_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn gate() -> Arc<GroupTransferGate> {
        let cfg = BrokerHaConfig {
            group_commit_wait_rounds: 5,
            group_commit_wait_interval_ms: 1,
            ..BrokerHaConfig::default()
        };
        GroupTransferGate::new(Arc::new(AtomicI64::new(0)), &cfg)
    }

    #[tokio::test]
    async fn already_satisfied_returns_immediately() {
        let gate = gate();
        gate.notify_transfer_some(100);
        assert!(gate.wait_for(50).await);
    }

    #[tokio::test]
    async fn wakes_once_offset_catches_up() {
        let gate = gate();
        let gate2 = gate.clone();
        let driver = tokio::spawn(async move {
            let mut read_list = Vec::new();
            for _ in 0..10 {
                tokio::select! {
                    _ = gate2.notified() => {}
                    _ = tokio::time::sleep(gate2.wait_interval()) => {}
                }
                gate2.drive(&mut read_list);
            }
        });
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_for(1_000_000).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        gate.notify_transfer_some(1_000_000);
        assert!(waiter.await.unwrap());
        driver.abort();
    }

    #[tokio::test]
    async fn exhausts_rounds_and_reports_failure() {
        let cfg = BrokerHaConfig {
            group_commit_wait_rounds: 2,
            group_commit_wait_interval_ms: 1,
            ..BrokerHaConfig::default()
        };
        let gate = GroupTransferGate::new(Arc::new(AtomicI64::new(0)), &cfg);
        let gate2 = gate.clone();
        let driver = tokio::spawn(async move {
            let mut read_list = Vec::new();
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                gate2.drive(&mut read_list);
            }
        });
        let ok = gate.wait_for(1).await;
        assert!(!ok);
        driver.abort();
    }
}
