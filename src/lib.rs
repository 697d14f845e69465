//! Wharf - embeddable HTTP/1.x server library
//!
//! A bounded pool of connection handlers, each owning one TCP or TLS socket
//! for its whole lifetime and driving it through parse, dispatch and respond
//! cycles. Supports HTTP pipelining, streaming and chunked response bodies,
//! cancellation of in-flight handlers on peer disconnect, and keep-alive
//! connection reuse.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wharf::config::Config;
//! use wharf::server::Listener;
//! use wharf::static_files::StaticFileController;
//!
//! #[tokio::main]
//! async fn main() -> wharf::Result<()> {
//!     let config = Config::for_port(8080);
//!     let handler = Arc::new(StaticFileController::new(config.static_files.clone()));
//!     Listener::bind(config, handler).await?.run().await
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod session;
pub mod static_files;

pub use error::{Result, WharfError};
