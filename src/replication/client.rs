//! Slave-side replicator: maintains an outbound connection to the master,
//! reports its local max offset, and applies framed log data as it arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::BrokerHaConfig;
use crate::log::Log;

use super::frame::{self, FrameAssembler};
use super::{ReplicationError, Result};

/// A socket is closed if no bytes at all arrive for this many heartbeat
/// intervals -- distinct from the heartbeat interval itself, which governs
/// how often *this* side speaks when otherwise idle.
const HOUSEKEEPING_INTERVAL_FACTOR: u32 = 3;

/// Single-task, selector-driven (via tokio's reactor) slave-side replication
/// client. See the module-level state machine table in the specification:
/// Disconnected -> Connected-Idle/Connected-Reading -> Disconnected.
pub struct HAClient<L: Log> {
    master_addr: String,
    log: Arc<L>,
    config: BrokerHaConfig,
    stop: Arc<Notify>,
    stopped: AtomicBool,
}

impl<L: Log + 'static> HAClient<L> {
    pub fn new(master_addr: impl Into<String>, log: Arc<L>, config: BrokerHaConfig) -> Arc<Self> {
        Arc::new(Self {
            master_addr: master_addr.into(),
            log,
            config,
            stop: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    /// Connect, report, and apply log data until [`Self::shutdown`] is
    /// called, reconnecting with exponential backoff on any error.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = Duration::from_millis(200);
        while !self.stopped.load(Ordering::Acquire) {
            match self.connect_and_serve().await {
                Ok(()) => return,
                Err(e) => warn!("HA client connection to {} failed: {e}", self.master_addr),
            }
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.stop.notified() => return,
            }
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    async fn connect_and_serve(&self) -> Result<()> {
        let mut stream = TcpStream::connect(&self.master_addr).await?;
        info!("connected to master {}", self.master_addr);

        let mut reported_offset = self.log.max_physical_offset();
        frame::write_offset_report(&mut stream, reported_offset).await?;

        let mut asm = FrameAssembler::new(self.config.replication_buffer_len);
        let heartbeat = Duration::from_millis(self.config.slave_heartbeat_interval_ms);
        let housekeeping = heartbeat * HOUSEKEEPING_INTERVAL_FACTOR;
        let mut last_activity = Instant::now();
        let mut heartbeat_timer = tokio::time::interval(heartbeat);
        heartbeat_timer.tick().await; // first tick fires immediately

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }

            asm.compact_if_full();
            tokio::select! {
                res = stream.read(asm.write_slice()) => {
                    let n = res?;
                    if n == 0 {
                        debug!("master {} closed the connection", self.master_addr);
                        return Err(ReplicationError::Closed);
                    }
                    asm.advance_write(n);
                    last_activity = Instant::now();

                    while let Some(frame) = asm.try_take_frame() {
                        let local_max = self.log.max_physical_offset();
                        if local_max != 0 && local_max != frame.phy_offset {
                            error!(
                                "replication divergence: local_max_phy_offset={local_max} master \
                                 frame starts at {}", frame.phy_offset
                            );
                            return Err(ReplicationError::Diverged {
                                local_offset: local_max,
                                frame_offset: frame.phy_offset,
                            });
                        }
                        self.log.append(frame.phy_offset, &frame.body)?;
                    }

                    let new_offset = self.log.max_physical_offset();
                    if new_offset != reported_offset {
                        frame::write_offset_report(&mut stream, new_offset).await?;
                        reported_offset = new_offset;
                    }
                }
                _ = heartbeat_timer.tick() => {
                    if last_activity.elapsed() >= housekeeping {
                        debug!("no data from master {} for {:?}, reconnecting", self.master_addr, housekeeping);
                        return Err(ReplicationError::Closed);
                    }
                    frame::write_offset_report(&mut stream, reported_offset).await?;
                }
                _ = self.stop.notified() => return Ok(()),
            }
        }
    }
}
