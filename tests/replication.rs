//! End-to-end replication scenarios: a real master/slave pair over loopback
//! TCP, and the group-commit gate wired to a live `push2slave_max_offset`.

use std::sync::Arc;
use std::time::Duration;

use broker_ha_index::log::{InMemoryLog, Log};
use broker_ha_index::{BrokerHaConfig, HAClient, HAServer};
use tokio::net::TcpListener;

fn enable_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn spawn_master(
    log: Arc<InMemoryLog>,
    config: BrokerHaConfig,
) -> (Arc<HAServer<InMemoryLog>>, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HAServer::new(log, config);
    let server2 = server.clone();
    tokio::spawn(async move { server2.run(listener).await });
    (server, addr)
}

#[tokio::test]
async fn replication_happy_path_reaches_one_megabyte() {
    enable_logging();
    let config = BrokerHaConfig {
        max_push_frame_len: 64 * 1024,
        ..BrokerHaConfig::default()
    };

    let master_log = Arc::new(InMemoryLog::new());
    let (master, addr) = spawn_master(master_log.clone(), config).await;

    let slave_log = Arc::new(InMemoryLog::new());
    let client = HAClient::new(addr.to_string(), slave_log.clone(), config);
    let client_task = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let one_mb = 1024 * 1024;
    let chunk = vec![7u8; 64 * 1024];
    let mut written = 0i64;
    while written < one_mb {
        master_log.append(written, &chunk).unwrap();
        written += chunk.len() as i64;
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if slave_log.max_physical_offset() >= one_mb {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slave did not catch up in time");

    assert_eq!(slave_log.max_physical_offset(), one_mb);
    assert!(master.gate().push2slave_max_offset() >= one_mb);

    client.shutdown();
    master.shutdown();
    client_task.abort();
}

#[tokio::test]
async fn group_commit_gate_unblocks_once_slave_acks() {
    enable_logging();
    let config = BrokerHaConfig {
        group_commit_wait_rounds: 5,
        group_commit_wait_interval_ms: 200,
        ..BrokerHaConfig::default()
    };

    let master_log = Arc::new(InMemoryLog::new());
    let (master, addr) = spawn_master(master_log.clone(), config).await;
    master_log.append(0, &vec![0u8; 500_000]).unwrap();

    let slave_log = Arc::new(InMemoryLog::new());
    let client = HAClient::new(addr.to_string(), slave_log.clone(), config);
    let client_task = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    // Wait for the slave to actually ack up to 500_000 before gating on 1_000_000.
    tokio::time::timeout(Duration::from_secs(5), async {
        while master.gate().push2slave_max_offset() < 500_000 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slave did not ack initial bytes in time");

    let gate = master.gate().clone();
    let waiter = tokio::spawn(async move { gate.wait_for(1_000_000).await });

    master_log.append(500_000, &vec![0u8; 500_000]).unwrap();

    let ok = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("gate wait task timed out")
        .unwrap();
    assert!(ok, "group-commit gate should have signalled success");

    client.shutdown();
    master.shutdown();
    client_task.abort();
}

#[tokio::test]
async fn divergent_slave_closes_without_corrupting_its_log() {
    enable_logging();

    // A bare listener standing in for a master whose first frame disagrees
    // with the slave's reported offset -- the scenario the divergence check
    // exists to catch.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fake_master = tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut sock, _) = listener.accept().await.unwrap();
        let reported = sock.read_i64().await.unwrap();
        assert_eq!(reported, 500);

        // One wire frame: [8-byte BE phy_offset][4-byte BE body_len][body].
        sock.write_i64(600).await.unwrap();
        sock.write_u32(2).await.unwrap();
        sock.write_all(b"xx").await.unwrap();
        sock.flush().await.unwrap();
        // Keep the connection open briefly so the slave has time to react.
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let slave_log = Arc::new(InMemoryLog::new());
    slave_log.append(0, &vec![1u8; 500]).unwrap();

    let client = HAClient::new(
        addr.to_string(),
        slave_log.clone(),
        BrokerHaConfig::default(),
    );
    // `connect_and_serve` is private; drive through the public reconnect
    // loop briefly and confirm the slave's log never absorbs the
    // mismatched frame.
    let task = tokio::spawn(async move { client.run().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    task.abort();
    fake_master.abort();

    assert_eq!(
        slave_log.max_physical_offset(),
        500,
        "diverged slave must not apply the mismatched frame"
    );
}
