//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use netguard::config::{ClientIoConfig, MonitorConfig, ServerConfig};
use netguard::monitor::IpAddressRequestMonitor;
use netguard::net::IoPool;
use netguard::service::{ConnectionService, EchoHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[allow(dead_code)]
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Knobs for a test service; everything else is default.
pub struct TestService {
    pub server: ServerConfig,
    pub client_io: ClientIoConfig,
    pub monitor: MonitorConfig,
}

impl Default for TestService {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client_io: ClientIoConfig {
                read_timeout_ms: 2_000,
                ..ClientIoConfig::default()
            },
            monitor: MonitorConfig::default(),
        }
    }
}

impl TestService {
    /// Start an echo service on `port`, optionally sharing an existing monitor.
    pub fn start(
        self,
        port: u16,
        monitor: Option<Arc<IpAddressRequestMonitor>>,
    ) -> (Arc<ConnectionService>, SocketAddr) {
        let monitor =
            monitor.unwrap_or_else(|| Arc::new(IpAddressRequestMonitor::new(&self.monitor)));
        let service = ConnectionService::new(
            self.server,
            &self.client_io,
            monitor,
            Arc::new(EchoHandler),
            IoPool::current(),
        );
        let addr = service.start_on(loopback(port)).unwrap();
        (service, addr)
    }
}

/// Send a whole request, half-close, and read until the server closes.
///
/// Write and read errors are tolerated: a refused peer may be reset.
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = stream.write_all(request).await;
    let _ = stream.shutdown().await;
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    response
}

/// Poll `condition` until it holds or a second passes.
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
