//! Demo: runs an in-process master (index + HA server) and slave (HA
//! client) over a loopback TCP connection, dispatching a handful of
//! synthetic messages and reporting the replicated/queryable state.

use std::sync::Arc;
use std::time::Duration;

use broker_ha_index::log::{
    DispatchRequest, InMemoryCheckpointStore, InMemoryLog, Log, MessageType,
};
use broker_ha_index::CheckpointStore;
use broker_ha_index::{BrokerHaConfig, HAClient, HAServer, IndexService};
use clap::Parser;
use tokio::net::TcpListener;

/// Run a toy master/slave pair in one process to exercise the index and
/// replicator end to end.
#[derive(Parser)]
struct Cli {
    /// Number of synthetic messages to dispatch.
    #[arg(long, default_value_t = 20)]
    messages: usize,

    /// Topic used for the synthetic messages.
    #[arg(long, default_value = "orders")]
    topic: String,
}

#[tokio::main]
async fn main() {
    let _ = env_logger::try_init();
    let args = Cli::parse();

    let index_dir = tempfile_dir();
    let config = BrokerHaConfig::default();

    let master_log = Arc::new(InMemoryLog::new());
    let index = IndexService::new(&index_dir, config).expect("create index service");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind HA port");
    let master_addr = listener.local_addr().expect("local addr");

    let ha_server = HAServer::new(master_log.clone(), config);
    let ha_server_task = {
        let server = ha_server.clone();
        tokio::spawn(async move { server.run(listener).await })
    };

    let slave_log = Arc::new(InMemoryLog::new());
    let ha_client = HAClient::new(master_addr.to_string(), slave_log.clone(), config);
    let ha_client_task = {
        let client = ha_client.clone();
        tokio::spawn(async move { client.run().await })
    };

    for i in 0..args.messages {
        let key = format!("key-{}", i % 5);
        let body = format!("message body {i}");
        let offset = master_log.max_physical_offset();
        master_log
            .append(offset, body.as_bytes())
            .expect("append to master log");

        let req = DispatchRequest {
            topic: args.topic.clone(),
            keys: key,
            commit_log_offset: offset,
            store_timestamp: demo_timestamp(i),
            msg_type: MessageType::Normal,
        };
        index.build_index(&req).expect("index dispatched message");

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Give the slave a moment to catch up before reporting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!(
        "master_offset={} slave_offset={} is_slave_ok={}",
        master_log.max_physical_offset(),
        slave_log.max_physical_offset(),
        ha_server.is_slave_ok(master_log.max_physical_offset()),
    );

    let (offsets, last_ts, last_offset) = index.query_offset(&args.topic, "key-0", 10, 0, i64::MAX);
    println!("key-0 offsets={offsets:?} last_update_ts={last_ts} last_update_phy={last_offset}");

    ha_client.shutdown();
    ha_server.shutdown();
    ha_client_task.abort();
    ha_server_task.abort();

    let checkpoint = InMemoryCheckpointStore::new();
    checkpoint.set_index_msg_timestamp(last_ts);
}

fn tempfile_dir() -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("broker-ha-index-demo-{}", std::process::id()));
    dir
}

/// Synthetic, monotonically increasing timestamp for the `i`-th demo
/// message (milliseconds since an arbitrary epoch).
fn demo_timestamp(i: usize) -> i64 {
    1_700_000_000_000 + i as i64 * 10
}
