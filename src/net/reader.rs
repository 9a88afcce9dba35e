//! Request reading with a cumulative deadline and a size cap.
//!
//! # Responsibilities
//! - Read a client's request until the client half-closes (EOF)
//! - Bound the whole request, not each read, by one deadline
//! - Stop at the first chunk that takes the request past the size limit
//!
//! # Design Decisions
//! - One read in flight at a time; the next is issued only after the previous
//!   completes
//! - On any failure the input half is shut down before returning, leaving the
//!   output half open for an error response

use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;

use crate::config::ClientIoConfig;
use crate::net::client::ClientNetworkId;

/// Bytes reserved ahead of each read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

/// Why a request could not be read. Every variant keeps what was read so far.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("request read timed out after {elapsed:?} ({} bytes read)", .partial.len())]
    TimedOut { partial: BytesMut, elapsed: Duration },
    #[error("request exceeded {limit} bytes ({} bytes read)", .partial.len())]
    Overflow { partial: BytesMut, limit: usize },
    #[error("request read failed after {} bytes: {source}", .partial.len())]
    Io {
        partial: BytesMut,
        #[source]
        source: io::Error,
    },
}

/// Failure class of a [`ReadError`], used for counters and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadFailureKind {
    Timeout,
    Overflow,
    Io,
}

impl ReadFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadFailureKind::Timeout => "timeout",
            ReadFailureKind::Overflow => "overflow",
            ReadFailureKind::Io => "io",
        }
    }
}

impl ReadError {
    pub fn kind(&self) -> ReadFailureKind {
        match self {
            ReadError::TimedOut { .. } => ReadFailureKind::Timeout,
            ReadError::Overflow { .. } => ReadFailureKind::Overflow,
            ReadError::Io { .. } => ReadFailureKind::Io,
        }
    }

    pub fn partial(&self) -> &BytesMut {
        match self {
            ReadError::TimedOut { partial, .. }
            | ReadError::Overflow { partial, .. }
            | ReadError::Io { partial, .. } => partial,
        }
    }

    pub fn into_partial(self) -> BytesMut {
        match self {
            ReadError::TimedOut { partial, .. }
            | ReadError::Overflow { partial, .. }
            | ReadError::Io { partial, .. } => partial,
        }
    }
}

/// Reads one request per connection.
#[derive(Debug, Clone)]
pub struct ClientRequestReader {
    max_read_size: usize,
    read_timeout: Option<Duration>,
    chunk_size: usize,
}

impl ClientRequestReader {
    /// `max_read_size == 0` and a zero `read_timeout` each mean unlimited.
    pub fn new(max_read_size: usize, read_timeout: Duration) -> Self {
        Self {
            max_read_size,
            read_timeout: (!read_timeout.is_zero()).then_some(read_timeout),
            chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    pub fn from_config(config: &ClientIoConfig) -> Self {
        Self::new(config.max_request_size, config.read_timeout()).with_chunk_size(config.read_chunk_size)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Read until EOF, appending to `buffer`.
    pub async fn read_request(
        &self,
        client: &ClientNetworkId,
        mut buffer: BytesMut,
    ) -> Result<Bytes, ReadError> {
        let started = Instant::now();
        let deadline = self.read_timeout.map(|timeout| started + timeout);

        loop {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => {
                        return Err(self.fail(
                            client,
                            ReadError::TimedOut {
                                partial: buffer,
                                elapsed: started.elapsed(),
                            },
                        ))
                    }
                },
                None => None,
            };

            buffer.reserve(self.chunk_size);
            let outcome = match remaining {
                Some(left) => tokio::time::timeout(left, read_chunk(client.stream(), &mut buffer))
                    .await
                    .ok(),
                None => Some(read_chunk(client.stream(), &mut buffer).await),
            };

            match outcome {
                None => {
                    return Err(self.fail(
                        client,
                        ReadError::TimedOut {
                            partial: buffer,
                            elapsed: started.elapsed(),
                        },
                    ))
                }
                Some(Ok(0)) => {
                    tracing::trace!(
                        connection_id = %client.id(),
                        bytes = buffer.len(),
                        "Request read"
                    );
                    return Ok(buffer.freeze());
                }
                Some(Ok(_)) => {
                    if self.max_read_size != 0 && buffer.len() > self.max_read_size {
                        return Err(self.fail(
                            client,
                            ReadError::Overflow {
                                partial: buffer,
                                limit: self.max_read_size,
                            },
                        ));
                    }
                }
                Some(Err(source)) => {
                    return Err(self.fail(client, ReadError::Io { partial: buffer, source }));
                }
            }
        }
    }

    fn fail(&self, client: &ClientNetworkId, error: ReadError) -> ReadError {
        if let Err(shutdown_error) = client.shutdown_input() {
            tracing::trace!(
                connection_id = %client.id(),
                error = %shutdown_error,
                "Input shutdown after failed read"
            );
        }
        tracing::debug!(
            connection_id = %client.id(),
            peer_addr = %client.peer_addr(),
            kind = error.kind().as_str(),
            bytes = error.partial().len(),
            "Request read failed"
        );
        error
    }
}

async fn read_chunk(stream: &TcpStream, buffer: &mut BytesMut) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read_buf(buffer) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
