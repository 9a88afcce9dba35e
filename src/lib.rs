//! Asynchronous TCP connection layer with per-IP abuse monitoring.
//!
//! - [`net`]: single-accept TCP server, request reader, response writer
//! - [`monitor`]: per-IP request counts, standings, housekeeping, checkpoints
//! - [`service`]: the controller that ties them together

pub mod config;
pub mod lifecycle;
pub mod monitor;
pub mod net;
pub mod observability;
pub mod service;

pub use config::ServiceConfig;
pub use monitor::IpAddressRequestMonitor;
pub use net::AsyncNetworkServer;
pub use service::ConnectionService;
