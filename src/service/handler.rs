//! Pluggable request processing.

use bytes::Bytes;

use crate::monitor::IpStanding;
use crate::net::{ClientNetworkId, ReadError};

/// Server status byte that follows the standing byte in every response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Available = 0,
    Busy = 1,
    NotAvailable = 2,
}

/// Sent to temporarily blocked IPs.
pub static BLOCKED_RESPONSE: [u8; 1] = [IpStanding::TemporarilyBlocked as u8];

/// Sent when the active connection count is at the busy threshold.
pub static BUSY_RESPONSE: [u8; 2] = [IpStanding::Ok as u8, ServerStatus::Busy as u8];

/// Sent while the application is marked unavailable. The trailing byte is an
/// empty message type.
pub static NOT_AVAILABLE_RESPONSE: [u8; 3] = [IpStanding::Ok as u8, ServerStatus::NotAvailable as u8, 0];

/// What a handler made of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestVerdict {
    /// Write this response; the request counts as legitimate once it is written.
    Legitimate(Bytes),
    /// Close without a response and count the request as erroneous.
    Erroneous,
}

/// Business logic behind the connection service.
///
/// Runs on the I/O pool, once per connection, after the whole request has been
/// read. The static responses default to the status-byte protocol above.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, client: &ClientNetworkId, request: Bytes) -> RequestVerdict;

    /// Optional reply after a failed read. The input half is already closed.
    fn read_failure_response(&self, _error: &ReadError) -> Option<Bytes> {
        None
    }

    fn blocked_response(&self) -> Bytes {
        Bytes::from_static(&BLOCKED_RESPONSE)
    }

    fn busy_response(&self) -> Bytes {
        Bytes::from_static(&BUSY_RESPONSE)
    }

    fn not_available_response(&self) -> Bytes {
        Bytes::from_static(&NOT_AVAILABLE_RESPONSE)
    }
}

/// Replies with the request, prefixed by the OK/available status bytes.
/// Empty requests are erroneous.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, _client: &ClientNetworkId, request: Bytes) -> RequestVerdict {
        if request.is_empty() {
            return RequestVerdict::Erroneous;
        }
        let mut response = Vec::with_capacity(request.len() + 2);
        response.push(IpStanding::Ok as u8);
        response.push(ServerStatus::Available as u8);
        response.extend_from_slice(&request);
        RequestVerdict::Legitimate(Bytes::from(response))
    }
}
