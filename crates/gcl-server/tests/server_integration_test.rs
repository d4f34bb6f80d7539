//! Server Integration Tests
//!
//! Two servers on loopback TCP replicating one log.

use gcl_core::replication::{ReplicationMessage, TcpTransport, Transport};
use gcl_core::{GclName, RecordStore};
use gcl_server::{Config, GclServer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn config(name: &str, peer: &str, peer_addr: SocketAddr, quorum: u32) -> Config {
    let mut config = Config::from_toml_str(&format!(
        r#"
name = "{name}"
logs = ["orders"]

[replication]
peers = "server-a;server-b"
ack-quorum = {quorum}
sync-interval-secs = 0
"#
    ))
    .unwrap();
    config.routes.insert(peer.to_string(), peer_addr);
    config
}

#[tokio::test]
async fn test_append_replicates_over_tcp() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let a = GclServer::start_with_listener(config("server-a", "server-b", addr_b, 2), listener_a)
        .await
        .unwrap();
    let b = GclServer::start_with_listener(config("server-b", "server-a", addr_a, 2), listener_b)
        .await
        .unwrap();

    let log = GclName::from_human("orders");
    let writer = TcpTransport::new(
        GclName::from_human("writer"),
        HashMap::from([(a.name(), addr_a)]),
    );

    for i in 1..=3u64 {
        let response = writer
            .send(
                a.name(),
                ReplicationMessage::Append {
                    log,
                    data: format!("order-{}", i).into_bytes(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ReplicationMessage::Appended {
                log,
                recno: i,
                acks: 2
            }
        );
    }

    // quorum 2 means b committed every record before the writer heard back
    let replica = b.service().log(&log).unwrap();
    assert_eq!(replica.store().max_recno(), 3);
    assert_eq!(replica.store().read(2).unwrap().data, b"order-2");
    assert_eq!(a.service().stats().replies_sent, 3);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_writer_told_about_quorum_failure() {
    let (listener_a, addr_a) = bind().await;
    // nobody listens here
    let (unused, dead_addr) = bind().await;
    drop(unused);

    let a = GclServer::start_with_listener(config("server-a", "server-b", dead_addr, 2), listener_a)
        .await
        .unwrap();

    let log = GclName::from_human("orders");
    let writer = TcpTransport::new(
        GclName::from_human("writer"),
        HashMap::from([(a.name(), addr_a)]),
    )
    .with_timeouts(Duration::from_secs(1), Duration::from_secs(10));

    let response = writer
        .send(
            a.name(),
            ReplicationMessage::Append {
                log,
                data: b"lonely".to_vec(),
            },
        )
        .await
        .unwrap();
    match response {
        ReplicationMessage::Failure { recno, code, .. } => {
            assert_eq!(recno, 1);
            assert_eq!(code, gcl_core::replication::protocol::nak::REPLICATE_FAIL);
        }
        other => panic!("unexpected {:?}", other),
    }
    // durable locally regardless
    assert!(a.service().read(&log, 1).is_ok());

    a.shutdown().await;
}
