//! Connection service: the server's controller.
//!
//! # Responsibilities
//! - Admit connections up to `max_connections`
//! - Route each connection by the peer IP's standing
//! - Report every request outcome to the IP monitor
//! - Keep connection and request totals
//!
//! # Per-connection flow
//! ```text
//! accepted → standing?
//!     Blacklisted        → report denied, close
//!     TemporarilyBlocked → read (discard), blocked response, report denied
//!     Ok, unavailable    → read (discard), not-available response
//!     Ok, busy           → read (discard), busy response
//!     Ok                 → read → handler → response
//! every path → connection finished → renew accept
//! ```

pub mod connections;
pub mod handler;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;

use crate::config::{ClientIoConfig, ServerConfig};
use crate::monitor::{IpAddressRequestMonitor, IpStanding};
use crate::net::{
    AsyncNetworkServer, ClientNetworkId, ClientRequestReader, ClientResponseWriter, EventLevel,
    IoPool, ReadError, ReadFailureKind, ServerController, ServerError,
};
use crate::observability::metrics;

pub use connections::{ConnectionTracker, RequestCounters};
pub use handler::{EchoHandler, RequestHandler, RequestVerdict, ServerStatus};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Initialised = 0,
    Started = 1,
    Shutdown = 2,
}

impl From<u8> for ServiceState {
    fn from(val: u8) -> Self {
        match val {
            0 => ServiceState::Initialised,
            1 => ServiceState::Started,
            _ => ServiceState::Shutdown,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is {0:?}; it can only be started once")]
    InvalidState(ServiceState),
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub state: ServiceState,
    pub application_available: bool,
    pub max_connections: usize,
    pub busy_threshold: usize,
    pub active_connections: usize,
    pub peak_connections: usize,
    pub peak_connections_at: u64,
    pub max_request_size: usize,
    pub read_timeout_ms: u64,
    pub legitimate_requests: u64,
    pub legitimate_request_bytes: u64,
    pub legitimate_response_bytes: u64,
    pub largest_request: usize,
    pub largest_response: usize,
    pub erroneous_requests: u64,
    pub read_timeouts: u64,
    pub read_overflows: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub denied_requests: u64,
    pub busy_responses: u64,
}

/// Ties the server, request I/O and the IP monitor together.
pub struct ConnectionService {
    me: Weak<ConnectionService>,
    server_config: ServerConfig,
    pool: IoPool,
    reader: ClientRequestReader,
    writer: ClientResponseWriter,
    monitor: Arc<IpAddressRequestMonitor>,
    handler: Arc<dyn RequestHandler>,
    /// Taken on shutdown to break the server → controller reference cycle.
    server: Mutex<Option<Arc<AsyncNetworkServer>>>,
    state: AtomicU8,
    available: AtomicBool,
    connections: ConnectionTracker,
    counters: RequestCounters,
}

impl ConnectionService {
    pub fn new(
        server_config: ServerConfig,
        client_io: &ClientIoConfig,
        monitor: Arc<IpAddressRequestMonitor>,
        handler: Arc<dyn RequestHandler>,
        pool: IoPool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            server_config,
            pool,
            reader: ClientRequestReader::from_config(client_io),
            writer: ClientResponseWriter::new(client_io.write_timeout()),
            monitor,
            handler,
            server: Mutex::new(None),
            state: AtomicU8::new(ServiceState::Initialised as u8),
            available: AtomicBool::new(true),
            connections: ConnectionTracker::new(),
            counters: RequestCounters::default(),
        })
    }

    /// Bind all interfaces on `port` and start accepting.
    pub fn start(self: &Arc<Self>, port: u16) -> Result<SocketAddr, ServiceError> {
        self.start_with(|server| server.start(port))
    }

    /// Bind `addr` and start accepting.
    pub fn start_on(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, ServiceError> {
        self.start_with(|server| server.start_on(addr))
    }

    fn start_with(
        self: &Arc<Self>,
        bind: impl FnOnce(&Arc<AsyncNetworkServer>) -> Result<(), ServerError>,
    ) -> Result<SocketAddr, ServiceError> {
        self.state
            .compare_exchange(
                ServiceState::Initialised as u8,
                ServiceState::Started as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|actual| ServiceError::InvalidState(ServiceState::from(actual)))?;

        let controller: Arc<dyn ServerController> = self.clone();
        let started = AsyncNetworkServer::new(controller).and_then(|server| {
            // Stored before binding: the first accept may complete inside `bind`.
            *self.server.lock() = Some(Arc::clone(&server));
            bind(&server).map(|()| server)
        });

        match started {
            Ok(server) => {
                let local_addr = server
                    .local_addr()
                    .ok_or_else(|| ServerError::Bind {
                        addr: SocketAddr::from(([0, 0, 0, 0], self.server_config.port)),
                        source: io::Error::from(io::ErrorKind::NotConnected),
                    })?;
                tracing::info!(
                    address = %local_addr,
                    max_connections = self.server_config.max_connections,
                    busy_threshold = self.server_config.busy_threshold,
                    "Connection service started"
                );
                Ok(local_addr)
            }
            Err(error) => {
                self.server.lock().take();
                self.state
                    .store(ServiceState::Shutdown as u8, Ordering::SeqCst);
                Err(error.into())
            }
        }
    }

    /// Stop accepting, drain in-flight connections, and release the server.
    pub async fn shutdown(&self, timeout: Duration) {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown(timeout).await;
        }
        self.state
            .store(ServiceState::Shutdown as u8, Ordering::SeqCst);
        self.connections.reset_active();
        metrics::set_active_connections(0);
        tracing::info!("Connection service shut down");
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn monitor(&self) -> &Arc<IpAddressRequestMonitor> {
        &self.monitor
    }

    /// While unavailable, OK clients get the not-available response.
    pub fn set_application_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(available, "Application availability changed");
    }

    pub fn is_application_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    pub fn is_busy(&self) -> bool {
        self.connections.active() >= self.server_config.busy_threshold
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let c = &self.counters;
        ServiceMetrics {
            state: self.state(),
            application_available: self.is_application_available(),
            max_connections: self.server_config.max_connections,
            busy_threshold: self.server_config.busy_threshold,
            active_connections: self.connections.active(),
            peak_connections: self.connections.peak(),
            peak_connections_at: self.connections.peak_at(),
            max_request_size: self.reader.max_read_size(),
            read_timeout_ms: self
                .reader
                .read_timeout()
                .map(|timeout| timeout.as_millis() as u64)
                .unwrap_or(0),
            legitimate_requests: RequestCounters::get(&c.legitimate),
            legitimate_request_bytes: RequestCounters::get(&c.legitimate_request_bytes),
            legitimate_response_bytes: RequestCounters::get(&c.legitimate_response_bytes),
            largest_request: c.largest_request.load(Ordering::Relaxed),
            largest_response: c.largest_response.load(Ordering::Relaxed),
            erroneous_requests: RequestCounters::get(&c.erroneous),
            read_timeouts: RequestCounters::get(&c.read_timeouts),
            read_overflows: RequestCounters::get(&c.read_overflows),
            read_failures: RequestCounters::get(&c.read_failures),
            write_failures: RequestCounters::get(&c.write_failures),
            denied_requests: RequestCounters::get(&c.denied),
            busy_responses: RequestCounters::get(&c.busy),
        }
    }

    async fn handle_connection(&self, client: ClientNetworkId) {
        let ip = client.ip();
        match self.monitor.standing(ip) {
            IpStanding::Blacklisted => {
                self.monitor.report_denied_request(ip);
                RequestCounters::bump(&self.counters.denied);
                metrics::record_denied_connection(IpStanding::Blacklisted.as_str());
                tracing::debug!(connection_id = %client.id(), ip = %ip, "Blacklisted connection closed");
            }
            IpStanding::TemporarilyBlocked => {
                if self.drain_request(&client).await {
                    let written = self.send(&client, self.handler.blocked_response()).await;
                    if written {
                        self.monitor.report_denied_request(ip);
                        RequestCounters::bump(&self.counters.denied);
                        metrics::record_denied_connection(IpStanding::TemporarilyBlocked.as_str());
                    }
                }
            }
            IpStanding::Ok if !self.is_application_available() => {
                if self.drain_request(&client).await {
                    self.send_static(&client, self.handler.not_available_response()).await;
                }
            }
            IpStanding::Ok if self.is_busy() => {
                if self.drain_request(&client).await {
                    RequestCounters::bump(&self.counters.busy);
                    metrics::record_busy_response();
                    self.send_static(&client, self.handler.busy_response()).await;
                }
            }
            IpStanding::Ok => self.serve_request(&client).await,
        }
    }

    async fn serve_request(&self, client: &ClientNetworkId) {
        let ip = client.ip();
        let request = match self.reader.read_request(client, BytesMut::new()).await {
            Ok(request) => request,
            Err(error) => {
                self.read_failed(client, &error);
                if let Some(response) = self.handler.read_failure_response(&error) {
                    // Best effort; the request is already counted as erroneous.
                    let _ = self.writer.write_response(client, response).await;
                }
                return;
            }
        };

        let request_size = request.len();
        match self.handler.handle(client, request) {
            RequestVerdict::Legitimate(response) => {
                let response_size = response.len();
                self.counters.record_legitimate(request_size, response_size);
                if self.send(client, response).await {
                    self.monitor.report_legitimate_request(ip);
                }
            }
            RequestVerdict::Erroneous => {
                RequestCounters::bump(&self.counters.erroneous);
                self.monitor.report_erroneous_request(ip);
                tracing::debug!(connection_id = %client.id(), ip = %ip, bytes = request_size, "Erroneous request");
            }
        }
    }

    /// Read and discard a request ahead of a static response.
    ///
    /// Returns false when the read failed; the failure is already reported.
    async fn drain_request(&self, client: &ClientNetworkId) -> bool {
        match self.reader.read_request(client, BytesMut::new()).await {
            Ok(_) => true,
            Err(error) => {
                self.read_failed(client, &error);
                false
            }
        }
    }

    /// Static responses count as legitimate once delivered.
    async fn send_static(&self, client: &ClientNetworkId, response: Bytes) {
        if self.send(client, response).await {
            self.monitor.report_legitimate_request(client.ip());
        }
    }

    /// Write a response. A failed write is reported as erroneous.
    async fn send(&self, client: &ClientNetworkId, response: Bytes) -> bool {
        match self.writer.write_response(client, response).await {
            Ok(_) => true,
            Err(error) => {
                RequestCounters::bump(&self.counters.write_failures);
                metrics::record_write_failure();
                self.monitor.report_erroneous_request(client.ip());
                tracing::debug!(
                    connection_id = %client.id(),
                    peer_addr = %client.peer_addr(),
                    error = %error,
                    "Response write failed"
                );
                false
            }
        }
    }

    fn read_failed(&self, client: &ClientNetworkId, error: &ReadError) {
        let kind = error.kind();
        let counter = match kind {
            ReadFailureKind::Timeout => &self.counters.read_timeouts,
            ReadFailureKind::Overflow => &self.counters.read_overflows,
            ReadFailureKind::Io => &self.counters.read_failures,
        };
        RequestCounters::bump(counter);
        metrics::record_read_failure(kind.as_str());
        self.monitor.report_erroneous_request(client.ip());
    }

    fn connection_finished(&self) {
        let active = self.connections.decrement();
        metrics::set_active_connections(active);

        let server = self.server.lock().clone();
        if let Some(server) = server {
            server.renew_accept();
        }
    }
}

/// Marks a connection finished when dropped, including when its task is aborted.
struct FinishGuard {
    service: Arc<ConnectionService>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.service.connection_finished();
    }
}

impl ServerController for ConnectionService {
    fn io_pool(&self) -> IoPool {
        self.pool.clone()
    }

    fn receive_buffer_size(&self) -> u32 {
        self.server_config.receive_buffer_size
    }

    fn backlog_size(&self) -> u32 {
        self.server_config.backlog
    }

    fn increment_active_connections(&self) {
        let active = self.connections.increment();
        metrics::set_active_connections(active);
    }

    fn can_accept_new_connection(&self) -> bool {
        self.connections.active() < self.server_config.max_connections
    }

    fn new_connection_accepted(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let Some(service) = self.me.upgrade() else {
            return;
        };
        let guard = FinishGuard { service };
        let client = ClientNetworkId::from_parts(stream, peer_addr);

        self.pool.spawn(async move {
            let guard = guard;
            guard.service.handle_connection(client).await;
        });
    }

    fn report_server_event(&self, level: EventLevel, message: &str) {
        match level {
            EventLevel::Info => tracing::info!(event = message, "Server event"),
            EventLevel::Warning => tracing::warn!(event = message, "Server event"),
            EventLevel::Error => tracing::error!(event = message, "Server event"),
        }
    }

    fn report_server_error(&self, error: &io::Error) {
        tracing::error!(error = %error, "Accept failed");
    }
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("state", &self.state())
            .field("active_connections", &self.connections.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn service(server_config: ServerConfig) -> Arc<ConnectionService> {
        let monitor = Arc::new(IpAddressRequestMonitor::new(&MonitorConfig {
            spam_requests_block_threshold: 3,
            erroneous_requests_block_threshold: 2,
            ..MonitorConfig::default()
        }));
        let client_io = ClientIoConfig {
            read_timeout_ms: 500,
            max_request_size: 64,
            ..ClientIoConfig::default()
        };
        ConnectionService::new(
            server_config,
            &client_io,
            monitor,
            Arc::new(EchoHandler),
            IoPool::current(),
        )
    }

    async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        response
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_and_counts_legitimate_requests() {
        let service = service(ServerConfig::default());
        let addr = service.start_on(loopback(28411)).unwrap();

        assert_eq!(exchange(addr, b"hi").await, b"\x00\x00hi");

        let metrics = service.metrics();
        assert_eq!(metrics.legitimate_requests, 1);
        assert_eq!(metrics.largest_request, 2);
        assert_eq!(metrics.largest_response, 4);
        assert_eq!(metrics.peak_connections, 1);

        service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(service.state(), ServiceState::Shutdown);
        assert_eq!(service.active_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cannot_start_twice() {
        let service = service(ServerConfig::default());
        service.start_on(loopback(28412)).unwrap();
        assert!(matches!(
            service.start_on(loopback(28413)),
            Err(ServiceError::InvalidState(ServiceState::Started))
        ));
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unavailable_application_gets_static_response() {
        let service = service(ServerConfig::default());
        let addr = service.start_on(loopback(28414)).unwrap();
        service.set_application_available(false);

        assert_eq!(exchange(addr, b"hello").await, handler::NOT_AVAILABLE_RESPONSE);
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_drain_skips_static_response() {
        let service = service(ServerConfig::default());
        let addr = service.start_on(loopback(28417)).unwrap();
        service.set_application_available(false);

        assert!(exchange(addr, &[9u8; 100]).await.is_empty());
        let metrics = service.metrics();
        assert_eq!(metrics.read_overflows, 1);
        assert_eq!(metrics.legitimate_requests, 0);
        assert_eq!(metrics.busy_responses, 0);
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_server_gets_busy_response() {
        let service = service(ServerConfig {
            busy_threshold: 1,
            ..ServerConfig::default()
        });
        let addr = service.start_on(loopback(28415)).unwrap();

        // The connection itself counts toward the threshold.
        assert_eq!(exchange(addr, b"hello").await, handler::BUSY_RESPONSE);
        assert_eq!(service.metrics().busy_responses, 1);
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn erroneous_requests_lead_to_block() {
        let service = service(ServerConfig::default());
        let addr = service.start_on(loopback(28416)).unwrap();

        // Empty requests are erroneous; two of them reach the threshold.
        assert!(exchange(addr, b"").await.is_empty());
        assert!(exchange(addr, b"").await.is_empty());
        assert_eq!(
            service.monitor().standing(loopback(0).ip()),
            IpStanding::TemporarilyBlocked
        );

        assert_eq!(exchange(addr, b"again").await, handler::BLOCKED_RESPONSE);
        // Denial is recorded after the response is flushed.
        for _ in 0..50 {
            if service.metrics().denied_requests == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let metrics = service.metrics();
        assert_eq!(metrics.erroneous_requests, 2);
        assert_eq!(metrics.denied_requests, 1);
        service.shutdown(Duration::from_secs(1)).await;
    }
}
