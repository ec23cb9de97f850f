//! # Game Client Library
//!
//! A headless protocol client for the game server. It performs the challenge
//! handshake, follows gamestates across map changes and restarts, keeps the
//! reliable command channel acknowledged, proves its archives to a pure
//! server, fetches archives through the windowed download and then streams
//! user commands while snapshots arrive. Rendering and input devices are not
//! part of this crate; the movement it sends is synthetic.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The protocol state machine without any I/O:
//! - Connectionless handshake with retries
//! - Gamestate, configuration strings and server id tracking
//! - Reliable command sequencing and acknowledgement
//! - Download reassembly and `nextdl`/`donedl` bookkeeping
//!
//! ### Network Module (`network`)
//! Binds a UDP socket and drives a session on a fixed frame interval.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use client::session::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:27960", ClientConfig::new("player")).await?;
//!     client.run(Some(500)).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod network;
pub mod session;

pub use error::ClientError;
pub use session::{ClientConfig, ClientSession, ConnectionState, Download};
