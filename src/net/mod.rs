//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → server.rs (single outstanding accept, admission via controller)
//!     → controller.rs (ServerController hand-off)
//!     → client.rs (ClientNetworkId: stream + peer address)
//!     → reader.rs (request until EOF, deadline, size cap)
//!     → writer.rs (response, then output half-close)
//!
//! Server States:
//!     Initialised → Bound → Shutdown → Terminated
//! ```
//!
//! # Design Decisions
//! - All accept and connection work runs on one tracked pool (pool.rs) so
//!   shutdown can drain it
//! - The server never blocks a connection on its own; admission is the
//!   controller's decision

pub mod client;
pub mod controller;
pub mod pool;
pub mod reader;
pub mod server;
pub mod writer;

pub use client::{ClientNetworkId, ConnectionId};
pub use controller::{EventLevel, ServerController};
pub use pool::IoPool;
pub use reader::{ClientRequestReader, ReadError, ReadFailureKind};
pub use server::{AsyncNetworkServer, ServerError, ServerState};
pub use writer::{ClientResponseWriter, WriteError};
