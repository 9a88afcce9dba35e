//! Asynchronous TCP server with a single outstanding accept.
//!
//! # Responsibilities
//! - Bind the listening socket with the controller's backlog and receive buffer
//! - Keep at most one accept pending, renewing it after every completion
//! - Ask the controller before every accept (backpressure)
//! - Close the acceptor and drain the I/O pool on shutdown
//!
//! # Design Decisions
//! - Renewal happens before the accepted connection is handed over, so accept
//!   throughput never waits on connection processing
//! - The pending-accept slot is an atomic flag won by compare-and-set; losers
//!   return immediately instead of blocking
//! - State moves to Shutdown before the listener is closed, so the accept
//!   failure caused by the close is recognised and not reported

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

use crate::net::controller::{EventLevel, ServerController};
use crate::net::pool::IoPool;
use crate::observability::metrics;

/// Lowest port the server will bind.
pub const MIN_PORT: u16 = 1024;

/// Server lifecycle. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initialised = 0,
    Bound = 1,
    Shutdown = 2,
    Terminated = 3,
}

impl From<u8> for ServerState {
    fn from(val: u8) -> Self {
        match val {
            0 => ServerState::Initialised,
            1 => ServerState::Bound,
            2 => ServerState::Shutdown,
            _ => ServerState::Terminated,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Initialised => "initialised",
            ServerState::Bound => "bound",
            ServerState::Shutdown => "shutdown",
            ServerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server must be {expected} for this operation, but is {actual}")]
    InvalidState {
        expected: ServerState,
        actual: ServerState,
    },
    #[error("port {0} is reserved; use a port greater than 1023")]
    InvalidPort(u16),
    #[error("receive buffer size cannot be less than 1 byte")]
    InvalidReceiveBufferSize,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Accepts connections and hands them to a [`ServerController`].
pub struct AsyncNetworkServer {
    controller: Arc<dyn ServerController>,
    pool: IoPool,
    receive_buffer_size: u32,
    listener: Mutex<Option<Arc<TcpListener>>>,
    /// Flipped to `true` when the acceptor closes; wakes a pending accept.
    closed: watch::Sender<bool>,
    accepting: AtomicBool,
    pending_accepts: AtomicUsize,
    state: AtomicU8,
}

impl AsyncNetworkServer {
    /// Create a server in the Initialised state.
    pub fn new(controller: Arc<dyn ServerController>) -> Result<Arc<Self>, ServerError> {
        let receive_buffer_size = controller.receive_buffer_size();
        if receive_buffer_size < 1 {
            return Err(ServerError::InvalidReceiveBufferSize);
        }

        let pool = controller.io_pool();
        let (closed, _) = watch::channel(false);

        Ok(Arc::new(Self {
            controller,
            pool,
            receive_buffer_size,
            listener: Mutex::new(None),
            closed,
            accepting: AtomicBool::new(false),
            pending_accepts: AtomicUsize::new(0),
            state: AtomicU8::new(ServerState::Initialised as u8),
        }))
    }

    /// Bind all interfaces on `port` and begin accepting.
    pub fn start(self: &Arc<Self>, port: u16) -> Result<(), ServerError> {
        self.start_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Bind `addr` and begin accepting.
    pub fn start_on(self: &Arc<Self>, addr: SocketAddr) -> Result<(), ServerError> {
        if !self.is_initialised() {
            return Err(ServerError::InvalidState {
                expected: ServerState::Initialised,
                actual: self.state(),
            });
        }
        if addr.port() < MIN_PORT {
            return Err(ServerError::InvalidPort(addr.port()));
        }

        let listener = {
            // Registering the socket needs the pool's reactor.
            let _runtime = self.pool.handle().enter();
            bind_listener(addr, self.receive_buffer_size, self.controller.backlog_size())
                .map_err(|source| ServerError::Bind { addr, source })?
        };
        let local_addr = listener.local_addr().ok();
        *self.listener.lock() = Some(Arc::new(listener));
        self.state.store(ServerState::Bound as u8, Ordering::SeqCst);

        tracing::info!(
            address = ?local_addr,
            backlog = self.controller.backlog_size(),
            receive_buffer_size = self.receive_buffer_size,
            "Server bound"
        );

        self.renew_accept();
        Ok(())
    }

    /// Issue the next accept if the server is bound, the controller admits
    /// another connection, and no accept is already pending.
    pub fn renew_accept(self: &Arc<Self>) {
        // The compare-and-set must stay last: winning it commits us to an accept.
        if self.is_bound()
            && self.controller.can_accept_new_connection()
            && self
                .accepting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.issue_accept();
        }
    }

    fn issue_accept(self: &Arc<Self>) {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            // Closed between the state check and here.
            self.accepting.store(false, Ordering::SeqCst);
            return;
        };

        self.pending_accepts.fetch_add(1, Ordering::SeqCst);
        let closed = self.closed.subscribe();
        let server = Arc::clone(self);

        self.pool.spawn(async move {
            let result = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = acceptor_closed(closed) => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "listening socket closed",
                )),
            };
            drop(listener);
            server.pending_accepts.fetch_sub(1, Ordering::SeqCst);

            match result {
                Ok((stream, peer_addr)) => server.accept_completed(stream, peer_addr),
                Err(error) => server.accept_failed(error),
            }
        });
    }

    fn accept_completed(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        self.accepting.store(false, Ordering::SeqCst);
        self.controller.increment_active_connections();
        metrics::record_connection_accepted();

        tracing::debug!(peer_addr = %peer_addr, "Connection accepted");

        self.renew_accept();
        self.controller.new_connection_accepted(stream, peer_addr);
    }

    fn accept_failed(self: &Arc<Self>, error: io::Error) {
        self.accepting.store(false, Ordering::SeqCst);
        self.renew_accept();

        // Failures after the acceptor closed are the close itself.
        if self.is_bound() {
            metrics::record_accept_failure();
            self.controller.report_server_error(&error);
        } else {
            tracing::trace!(error = %error, "Accept ended by shutdown");
        }
    }

    /// Stop accepting. Existing connections keep running. Idempotent.
    pub fn shutdown_acceptor(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            match ServerState::from(current) {
                ServerState::Initialised | ServerState::Bound => {}
                _ => return,
            }
            // State first, then close: a racing renewal sees Shutdown and stays quiet.
            match self.state.compare_exchange(
                current,
                ServerState::Shutdown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.closed.send_replace(true);
        self.listener.lock().take();
        tracing::info!("Acceptor shut down");
    }

    /// Close the acceptor, then drain the I/O pool.
    ///
    /// Waits up to `timeout` for outstanding tasks; if they do not finish, they
    /// are aborted and given another `timeout`. Must not be awaited from a task
    /// running on this server's pool.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.is_shutdown() {
            self.shutdown_acceptor();
        }
        if self.is_terminated() {
            return;
        }

        if !self.pool.drain(timeout).await {
            self.controller.report_server_event(
                EventLevel::Warning,
                "I/O pool was not drained within the shutdown timeout",
            );
            self.pool.abort_all();
            if !self.pool.drain(timeout).await {
                self.controller
                    .report_server_event(EventLevel::Error, "Could not drain the I/O pool");
            }
        }

        self.state.store(ServerState::Terminated as u8, Ordering::SeqCst);
        tracing::info!("Server terminated");
    }

    pub fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_initialised(&self) -> bool {
        self.state() == ServerState::Initialised
    }

    pub fn is_bound(&self) -> bool {
        self.state() == ServerState::Bound
    }

    /// True once the acceptor has closed, including after termination.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.state(), ServerState::Shutdown | ServerState::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ServerState::Terminated
    }

    /// Whether an accept is currently pending.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Accept operations issued and not yet completed. Never more than one.
    pub fn pending_accepts(&self) -> usize {
        self.pending_accepts.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, while it is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }
}

fn bind_listener(addr: SocketAddr, receive_buffer_size: u32, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_recv_buffer_size(receive_buffer_size)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn acceptor_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}
