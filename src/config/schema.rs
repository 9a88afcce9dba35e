//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listening socket and connection admission.
    pub server: ServerConfig,

    /// Per-connection read/write limits.
    pub client_io: ClientIoConfig,

    /// IP address request monitor.
    pub monitor: MonitorConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener and connection admission configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port. Must be greater than 1023.
    pub port: u16,

    /// Listen backlog handed to the OS.
    pub backlog: u32,

    /// `SO_RCVBUF` for the listening socket, in bytes.
    pub receive_buffer_size: u32,

    /// Worker threads in the I/O pool.
    pub io_threads: usize,

    /// Active connections at which new accepts are paused.
    pub max_connections: usize,

    /// Active connections at which clients get the busy response.
    pub busy_threshold: usize,

    /// Time allowed for each drain phase during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            backlog: 1024,
            receive_buffer_size: 8192,
            io_threads: 8,
            max_connections: 7000,
            busy_threshold: 5000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Request read / response write limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientIoConfig {
    /// Largest accepted request in bytes. Zero disables the limit.
    pub max_request_size: usize,

    /// Cumulative deadline for reading one request, in milliseconds. Zero disables it.
    pub read_timeout_ms: u64,

    /// Cumulative deadline for writing one response, in milliseconds. Zero disables it.
    pub write_timeout_ms: u64,

    /// Bytes reserved ahead of each read.
    pub read_chunk_size: usize,
}

impl ClientIoConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ClientIoConfig {
    fn default() -> Self {
        Self {
            max_request_size: 1691,
            read_timeout_ms: 13_309,
            write_timeout_ms: 0,
            read_chunk_size: 1024,
        }
    }
}

/// IP address request monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Length of a monitor period; housekeeping runs once per period.
    pub frequency_minutes: u64,

    /// Legitimate requests within one period that temporarily block an IP.
    /// Also the total below which a blocked IP is reinstated.
    pub spam_requests_block_threshold: u32,

    /// Erroneous requests within one period that temporarily block an IP.
    pub erroneous_requests_block_threshold: u32,

    /// Initial capacity of the IP map.
    pub initial_capacity: usize,

    /// Expected number of concurrently reporting threads; sizes the map shards.
    pub concurrency: usize,

    /// Directory holding the checkpoint file. Checkpointing is off when unset.
    pub checkpoint_dir: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_minutes.saturating_mul(60))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            frequency_minutes: 32,
            spam_requests_block_threshold: 5129,
            erroneous_requests_block_threshold: 47,
            initial_capacity: 10_000,
            concurrency: 30,
            checkpoint_dir: None,
        }
    }
}

/// Logging and metrics exposition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,

    /// Prometheus scrape address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "netguard=info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
