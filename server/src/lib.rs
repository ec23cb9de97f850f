//! # Game Server Connection Layer
//!
//! The server side of a client/server game protocol over UDP. It admits
//! clients through a challenge handshake, keeps a reliable command channel
//! alive on top of unreliable datagrams, hands out snapshots at each client's
//! rate, serves archive downloads and validates that clients run the same
//! content as the server. The game simulation itself sits behind the
//! `GameRules` trait.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Core
//! `ServerContext` owns all protocol state and performs no I/O. Datagrams go
//! in through `packet_event`, time advances through `frame`, and everything
//! the server wants to send collects in an outbox. Tests drive it directly
//! with a fixed seed.
//!
//! ### UDP Driver
//! `network::Server` binds the socket and runs a tokio loop that feeds the
//! context and forwards its outbox to a sender task.
//!
//! ## Module Organization
//!
//! - `config`: command line and defaults
//! - `error`: admission, slot and server errors
//! - `challenge`: challenge cache and authorization verdicts
//! - `drdos`: reflection guard for info and status queries
//! - `flood`: per-client reliable command limiter
//! - `reliable`: 64-entry reliable command ring
//! - `netchan`: sequenced channel with duplicate and loss detection
//! - `client_manager`: slot table, timeouts and pings
//! - `context`: server state, epochs, frame driver and config strings
//! - `connectionless`: out-of-band commands, admission and rcon
//! - `client_protocol`: sequenced client messages, snapshots and downloads
//! - `operator`: console commands
//! - `pure_check`: pure report validation
//! - `content`, `download`: archive catalog and windowed transfers
//! - `persistence`: saved player positions
//! - `game`: game rules collaborator
//! - `demo`: server side demo recording
//! - `network`: tokio UDP driver
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod client_manager;
pub mod client_protocol;
pub mod config;
pub mod connectionless;
pub mod content;
pub mod context;
pub mod demo;
pub mod download;
pub mod drdos;
pub mod error;
pub mod flood;
pub mod game;
pub mod netchan;
pub mod network;
pub mod operator;
pub mod persistence;
pub mod pure_check;
pub mod reliable;

pub use client_manager::{ClientSlot, ClientState};
pub use config::ServerConfig;
pub use context::{Collaborators, Outgoing, ServerContext};
pub use error::{AdmissionError, ServerError, SlotError};
