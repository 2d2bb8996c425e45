//! Master-side replicator: accepts slave connections and streams committed
//! log bytes to each of them, tracking acknowledgements through the
//! group-commit gate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::config::BrokerHaConfig;
use crate::log::Log;

use super::frame;
use super::gate::GroupCommitRequest;
use super::{GroupTransferGate, Result};

/// How often the write loop polls the log for new bytes when the slave is
/// fully caught up. The [`Log`] boundary has no wake primitive of its own
/// (see the specification's external-interfaces section), so this is a
/// plain poll rather than a condition-variable wait.
const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A live slave connection, as seen from outside its serving task.
#[derive(Clone)]
pub struct HAConnectionHandle {
    pub peer_addr: SocketAddr,
    slave_ack_offset: Arc<AtomicI64>,
}

impl HAConnectionHandle {
    pub fn slave_ack_offset(&self) -> i64 {
        self.slave_ack_offset.load(Ordering::Acquire)
    }
}

/// Accepts slave connections on a bound listener and streams log bytes to
/// each, per the push-loop/ack-loop design in the specification's HAServer
/// section.
pub struct HAServer<L: Log> {
    log: Arc<L>,
    config: BrokerHaConfig,
    gate: Arc<GroupTransferGate>,
    push2slave_max_offset: Arc<AtomicI64>,
    connection_count: Arc<AtomicI64>,
    connections: Mutex<Vec<HAConnectionHandle>>,
    stop: Arc<Notify>,
    stopped: AtomicBool,
}

impl<L: Log + 'static> HAServer<L> {
    pub fn new(log: Arc<L>, config: BrokerHaConfig) -> Arc<Self> {
        let push2slave_max_offset = Arc::new(AtomicI64::new(0));
        let gate = GroupTransferGate::new(push2slave_max_offset.clone(), &config);
        Arc::new(Self {
            log,
            config,
            gate,
            push2slave_max_offset,
            connection_count: Arc::new(AtomicI64::new(0)),
            connections: Mutex::new(Vec::new()),
            stop: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn gate(&self) -> &Arc<GroupTransferGate> {
        &self.gate
    }

    pub fn connection_count(&self) -> i64 {
        self.connection_count.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> Vec<HAConnectionHandle> {
        self.connections.lock().clone()
    }

    /// At least one slave exists and is within `fallbehind_max` bytes of
    /// `master_write_offset`.
    pub fn is_slave_ok(&self, master_write_offset: i64) -> bool {
        self.connection_count() > 0
            && master_write_offset - self.push2slave_max_offset.load(Ordering::Acquire)
                < self.config.fallbehind_max
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    /// Drive the accept loop and the group-commit gate until [`Self::shutdown`].
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let gate_driver = {
            let this = self.clone();
            tokio::spawn(async move { this.drive_gate().await })
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    info!("slave connected: {peer_addr}");
                    let this = self.clone();
                    tokio::spawn(async move { this.serve_connection(stream, peer_addr).await; });
                }
                _ = self.stop.notified() => break,
            }
        }
        gate_driver.abort();
        Ok(())
    }

    async fn drive_gate(&self) {
        let mut read_list: Vec<GroupCommitRequest> = Vec::new();
        loop {
            tokio::select! {
                _ = self.gate.notified() => {}
                _ = tokio::time::sleep(self.gate.wait_interval()) => {}
                _ = self.stop.notified() => {
                    self.gate.shutdown(&mut read_list);
                    return;
                }
            }
            self.gate.drive(&mut read_list);
        }
    }

    async fn serve_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let handle = HAConnectionHandle {
            peer_addr,
            slave_ack_offset: Arc::new(AtomicI64::new(0)),
        };
        self.connection_count.fetch_add(1, Ordering::AcqRel);
        self.connections.lock().push(handle.clone());

        if let Err(e) = self.connection_loop(stream, &handle).await {
            warn!("HA connection to {peer_addr} closed: {e}");
        }

        self.connections
            .lock()
            .retain(|h| !Arc::ptr_eq(&h.slave_ack_offset, &handle.slave_ack_offset));
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
    }

    async fn connection_loop(&self, stream: TcpStream, handle: &HAConnectionHandle) -> Result<()> {
        let mut stream = stream;
        let initial_offset = frame::read_offset_report(&mut stream).await?;
        handle
            .slave_ack_offset
            .store(initial_offset, Ordering::Release);
        self.gate.notify_transfer_some(initial_offset);

        let (mut read_half, mut write_half) = stream.into_split();

        let ack = handle.slave_ack_offset.clone();
        let gate = self.gate.clone();
        let mut read_task = tokio::spawn(async move {
            loop {
                let offset = frame::read_offset_report(&mut read_half).await?;
                ack.store(offset, Ordering::Release);
                gate.notify_transfer_some(offset);
            }
            #[allow(unreachable_code)]
            Ok::<(), super::ReplicationError>(())
        });

        let max_frame_len = self.config.max_push_frame_len as usize;
        let log = self.log.clone();
        let mut push_offset = initial_offset;
        let mut write_task = tokio::spawn(async move {
            loop {
                let available = log.max_physical_offset();
                if push_offset >= available {
                    tokio::time::sleep(PUSH_POLL_INTERVAL).await;
                    continue;
                }
                let body = log.read_slice(push_offset, max_frame_len)?;
                if body.is_empty() {
                    tokio::time::sleep(PUSH_POLL_INTERVAL).await;
                    continue;
                }
                frame::write_frame(&mut write_half, push_offset, &body).await?;
                push_offset += body.len() as i64;
            }
            #[allow(unreachable_code)]
            Ok::<(), super::ReplicationError>(())
        });

        let result = tokio::select! {
            r = &mut read_task => r.map_err(|_| super::ReplicationError::Closed).and_then(|r| r),
            w = &mut write_task => w.map_err(|_| super::ReplicationError::Closed).and_then(|r| r),
        };
        read_task.abort();
        write_task.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;

    #[tokio::test]
    async fn pushes_existing_and_new_log_bytes_to_slave() {
        let log = Arc::new(InMemoryLog::new());
        log.append(0, b"hello-world").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = HAServer::new(log.clone(), BrokerHaConfig::default());
        let server2 = server.clone();
        let server_task = tokio::spawn(async move { server2.run(listener).await });

        let mut sock = TcpStream::connect(addr).await.unwrap();
        frame::write_offset_report(&mut sock, 0).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                use tokio::io::AsyncReadExt;
                let phy_offset = sock.read_i64().await.unwrap();
                let body_len = sock.read_u32().await.unwrap() as usize;
                let mut body = vec![0u8; body_len];
                sock.read_exact(&mut body).await.unwrap();
                if !body.is_empty() {
                    return (phy_offset, body);
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(got.0, 0);
        assert_eq!(got.1, b"hello-world");
        assert_eq!(server.connection_count(), 1);

        server.shutdown();
        server_task.abort();
    }
}
