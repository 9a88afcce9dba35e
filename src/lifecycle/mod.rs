//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGINT → binary begins ordered shutdown
//!
//! Shutdown (shutdown.rs):
//!     trigger → background loops (monitor housekeeping) exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain connections, stop housekeeping,
//!   save checkpoint

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
