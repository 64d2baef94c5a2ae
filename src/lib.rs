//! Client-only Tor implementation
//!
//! Accepts application TCP traffic on a SOCKS5 port and relays it
//! through three-hop onion-encrypted circuits, with v3 hidden-service
//! support. The crate is organized as:
//!
//! - [`protocol`]: cells, link connections, circuits, streams, the
//!   directory client
//! - [`hs`]: the hidden-service v3 client
//! - [`pool`], [`path`], [`guards`], [`isolation`]: circuit management
//! - [`socks`]: the SOCKS5 front end
//! - [`client`]: the orchestrator tying it all together
//!
//! ```no_run
//! use tor_client::client::TorClient;
//! use tor_client::config::Config;
//! use std::sync::Arc;
//!
//! # async fn run() -> tor_client::error::Result<()> {
//! let client = Arc::new(TorClient::bootstrap(Config::default()).await?);
//! client.run().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod guards;
pub mod hs;
pub mod isolation;
pub mod path;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod socks;

pub use client::TorClient;
pub use config::Config;
pub use error::{ErrorCategory, Result, Severity, TorError};
