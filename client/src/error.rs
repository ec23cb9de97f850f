//! Client error types

use shared::packet::PacketError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error(transparent)]
    Packet(#[from] PacketError),

    /// More unacknowledged reliable commands than the server can hold
    #[error("client command overflow")]
    CommandOverflow,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("timed out waiting for the server")]
    Timeout,
}
