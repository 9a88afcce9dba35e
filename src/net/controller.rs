//! The collaborator an [`AsyncNetworkServer`](super::server::AsyncNetworkServer) reports to.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::net::pool::IoPool;

/// Severity of a server-level event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Supplies the server's resources and decides admission.
///
/// The server never decides on its own whether a connection may be accepted:
/// it asks [`can_accept_new_connection`](Self::can_accept_new_connection)
/// before every accept. Per-IP blocking is the controller's job.
pub trait ServerController: Send + Sync + 'static {
    /// Pool on which accepts and connection work run.
    fn io_pool(&self) -> IoPool;

    /// `SO_RCVBUF` for the listening socket.
    fn receive_buffer_size(&self) -> u32;

    /// Listen backlog.
    fn backlog_size(&self) -> u32;

    /// Called once per accepted connection, before the next accept is issued.
    fn increment_active_connections(&self);

    /// Admission check performed before every accept.
    fn can_accept_new_connection(&self) -> bool;

    /// Hand-off of an accepted connection. The controller owns it from here on.
    fn new_connection_accepted(&self, stream: TcpStream, peer_addr: SocketAddr);

    fn report_server_event(&self, level: EventLevel, message: &str);

    fn report_server_error(&self, error: &io::Error);
}
