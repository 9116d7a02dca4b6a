//! Epoll-driven, multi-threaded HTTP request-serving substrate.
//!
//! See [`net::server::Server`] for the entry point, [`memory`] for the
//! arena allocator hierarchy backing request/response buffers, and
//! [`concurrent::rtbr`] for the reclamation scheme that lets the arena
//! pool recycle memory without a global stop-the-world barrier.

pub mod concurrent;
pub mod config;
pub mod error;
pub mod memory;
pub mod net;
pub mod stats;

pub use error::{CoreError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
