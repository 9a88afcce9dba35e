//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! server, service and monitor produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are no-ops until a recorder is installed, so library
//!   users and tests pay nothing
//! - Log level comes from `RUST_LOG` first, then config

pub mod logging;
pub mod metrics;
