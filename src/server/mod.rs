//! Serving layer
//!
//! Listener, connection-handler pool and the per-connection state machine

pub mod connection;
pub mod handler;
pub mod listener;
pub mod pool;
pub mod socket;

pub use connection::{ConnState, ConnectionHandler, SocketGate};
pub use handler::{Cancel, CancellerSlot, Completion, DefaultHandler, RequestHandler, ServiceParams};
pub use listener::{Listener, ShutdownHandle};
pub use pool::ConnectionHandlerPool;
pub use socket::{configure_keepalive, Socket};

/// Pending-write byte count above which a writing task blocks until drained
pub const WRITE_HIGH_WATER: usize = 16_384;

/// TCP keep-alive idle time before the first probe
pub const KEEPALIVE_IDLE_SECS: u64 = 10;

/// TCP keep-alive probe interval
pub const KEEPALIVE_INTERVAL_SECS: u64 = 2;

/// Number of unanswered keep-alive probes before the connection is dropped
pub const KEEPALIVE_PROBES: u32 = 3;

/// Graceful shutdown and drain timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
