//! The HTTP substrate: request id codec, wire parser, per-connection
//! state machine, I/O thread loop, and server façade (spec §4.G-I).

pub mod connection;
pub mod io_thread;
pub mod parser;
pub mod request_id;
pub mod server;
