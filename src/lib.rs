//! advlock: a network advisory lock server.
//!
//! Clients connect over TCP, send a version line, then `set`, `del` and
//! `list` commands. Locks live as long as the connection that took them.
//!
//! - `registry`: the key to holder mapping
//! - `connection`: line framing and the per-client protocol state machine
//! - `server`: the single-threaded mio event loop
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use server::{Server, ServerHandle};
