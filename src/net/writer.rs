//! Response writing.

use std::io;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tokio::net::TcpStream;

use crate::net::client::ClientNetworkId;

/// Why a response could not be fully delivered.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("response write timed out with {} bytes unwritten", .remaining.len())]
    TimedOut { remaining: Bytes },
    #[error("response write failed with {} bytes unwritten: {source}", .remaining.len())]
    Io {
        remaining: Bytes,
        #[source]
        source: io::Error,
    },
}

impl WriteError {
    /// The part of the response that never reached the socket.
    pub fn remaining(&self) -> &Bytes {
        match self {
            WriteError::TimedOut { remaining } | WriteError::Io { remaining, .. } => remaining,
        }
    }
}

/// Writes a complete response, then half-closes the output.
#[derive(Debug, Clone, Default)]
pub struct ClientResponseWriter {
    write_timeout: Option<Duration>,
}

impl ClientResponseWriter {
    /// A zero timeout means unlimited.
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            write_timeout: (!write_timeout.is_zero()).then_some(write_timeout),
        }
    }

    /// Drain `response` into the socket. Returns the number of bytes written.
    ///
    /// Writes are issued one at a time; a failure stops the attempt and hands
    /// back the unwritten remainder.
    pub async fn write_response(
        &self,
        client: &ClientNetworkId,
        mut response: Bytes,
    ) -> Result<usize, WriteError> {
        let total = response.len();
        let deadline = self.write_timeout.map(|timeout| Instant::now() + timeout);

        while response.has_remaining() {
            let outcome = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => {
                        tokio::time::timeout(left, write_chunk(client.stream(), &response))
                            .await
                            .ok()
                    }
                    _ => None,
                },
                None => Some(write_chunk(client.stream(), &response).await),
            };

            match outcome {
                None => return Err(WriteError::TimedOut { remaining: response }),
                Some(Ok(0)) => {
                    return Err(WriteError::Io {
                        remaining: response,
                        source: io::Error::from(io::ErrorKind::WriteZero),
                    })
                }
                Some(Ok(n)) => response.advance(n),
                Some(Err(source)) => return Err(WriteError::Io { remaining: response, source }),
            }
        }

        client
            .shutdown_output()
            .map_err(|source| WriteError::Io { remaining: response, source })?;

        tracing::trace!(connection_id = %client.id(), bytes = total, "Response written");
        Ok(total)
    }
}

async fn write_chunk(stream: &TcpStream, chunk: &[u8]) -> io::Result<usize> {
    loop {
        stream.writable().await?;
        match stream.try_write(chunk) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
