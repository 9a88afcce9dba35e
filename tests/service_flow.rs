//! End-to-end connection handling through the connection service.

use std::time::{Duration, Instant};

use netguard::config::{ClientIoConfig, MonitorConfig, ServerConfig};
use netguard::monitor::IpStanding;
use netguard::service::handler::{BLOCKED_RESPONSE, BUSY_RESPONSE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;
use common::{eventually, exchange, loopback, TestService};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_round_trip() {
    let (service, addr) = TestService::default().start(28431, None);

    assert_eq!(exchange(addr, b"hello").await, b"\x00\x00hello");
    assert_eq!(exchange(addr, b"world").await, b"\x00\x00world");

    let metrics = service.metrics();
    assert_eq!(metrics.legitimate_requests, 2);
    assert_eq!(metrics.legitimate_request_bytes, 10);
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blacklisted_peer_is_dropped() {
    let (service, addr) = TestService::default().start(28432, None);
    let ip = loopback(0).ip();
    service.monitor().set_blacklisted(ip);

    assert!(exchange(addr, b"let me in").await.is_empty());
    assert!(eventually(|| service.metrics().denied_requests == 1).await);
    assert_eq!(service.monitor().ip_metrics(ip).unwrap().denied_requests, 1);
    assert_eq!(service.metrics().legitimate_requests, 0);
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spam_threshold_blocks_sixth_request() {
    let (service, addr) = TestService {
        monitor: MonitorConfig {
            spam_requests_block_threshold: 5,
            ..MonitorConfig::default()
        },
        ..TestService::default()
    }
    .start(28433, None);
    let ip = loopback(0).ip();

    for i in 0..5 {
        assert_eq!(exchange(addr, b"ok").await, b"\x00\x00ok", "request {i}");
    }
    assert!(eventually(|| service.monitor().standing(ip) == IpStanding::TemporarilyBlocked).await);

    assert_eq!(exchange(addr, b"ok").await, BLOCKED_RESPONSE);
    assert!(eventually(|| service.monitor().ip_metrics(ip).unwrap().denied_requests == 1).await);

    // A sweep with six requests this period keeps the block.
    service.monitor().run_housekeeping();
    assert_eq!(service.monitor().standing(ip), IpStanding::TemporarilyBlocked);

    // A quiet period lifts it.
    service.monitor().run_housekeeping();
    assert_eq!(service.monitor().standing(ip), IpStanding::Ok);
    assert_eq!(exchange(addr, b"back").await, b"\x00\x00back");
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_timeout_is_erroneous() {
    let (service, addr) = TestService {
        client_io: ClientIoConfig {
            read_timeout_ms: 150,
            ..ClientIoConfig::default()
        },
        ..TestService::default()
    }
    .start(28434, None);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"never finished").await.unwrap();

    let started = Instant::now();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .expect("server should close a timed out connection");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(response.is_empty());

    assert!(eventually(|| service.metrics().read_timeouts == 1).await);
    let erroneous = service
        .monitor()
        .ip_metrics(loopback(0).ip())
        .unwrap()
        .erroneous_requests;
    assert_eq!(erroneous, 1);
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_request_is_rejected() {
    let (service, addr) = TestService {
        client_io: ClientIoConfig {
            max_request_size: 16,
            read_timeout_ms: 2_000,
            ..ClientIoConfig::default()
        },
        ..TestService::default()
    }
    .start(28435, None);

    assert!(exchange(addr, &[b'x'; 4096]).await.is_empty());
    assert!(eventually(|| service.metrics().read_overflows == 1).await);
    assert_eq!(service.metrics().legitimate_requests, 0);
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit_defers_accept() {
    let (service, addr) = TestService {
        server: ServerConfig {
            max_connections: 1,
            busy_threshold: 100,
            ..ServerConfig::default()
        },
        ..TestService::default()
    }
    .start(28436, None);

    // First connection holds the only slot.
    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"one").await.unwrap();
    assert!(eventually(|| service.active_connections() == 1).await);

    // Second connection sits in the backlog and is not served yet.
    let second = tokio::spawn(exchange(addr, b"two"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second.is_finished());

    first.shutdown().await.unwrap();
    let mut response = Vec::new();
    first.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"\x00\x00one");

    let second = tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .expect("deferred connection should be served")
        .unwrap();
    assert_eq!(second, b"\x00\x00two");
    assert_eq!(service.metrics().peak_connections, 1);
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_threshold_sends_busy_response() {
    let (service, addr) = TestService {
        server: ServerConfig {
            busy_threshold: 2,
            ..ServerConfig::default()
        },
        ..TestService::default()
    }
    .start(28437, None);

    let mut holder = TcpStream::connect(addr).await.unwrap();
    holder.write_all(b"hold").await.unwrap();
    assert!(eventually(|| service.active_connections() == 1).await);

    assert_eq!(exchange(addr, b"late").await, BUSY_RESPONSE);
    assert_eq!(service.metrics().busy_responses, 1);

    holder.shutdown().await.unwrap();
    let mut response = Vec::new();
    holder.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"\x00\x00hold");
    service.shutdown(Duration::from_secs(1)).await;
}
