//! Error types of the connection layer
//!
//! Every error here is scoped: admission errors never touch a slot, slot errors
//! end exactly one connection, and nothing propagates into the frame loop.

use crate::pure_check::PureCheckError;
use shared::packet::PacketError;
use thiserror::Error;

/// Reasons a `connect` request is refused
///
/// The `Display` text is what the client sees in the `print` reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Server uses protocol version {0}")]
    ProtocolMismatch(i32),

    #[error("Reconnecting too soon")]
    ReconnectTooSoon,

    #[error("No or bad challenge for address.")]
    BadChallenge,

    #[error("You are banned from this server.")]
    Banned,

    #[error("Too many connections from the same IP")]
    TooManyFromIp,

    #[error("Invalid GUID detected")]
    InvalidGuid,

    #[error("Server is for high pings only")]
    PingTooLow,

    #[error("Server is for low pings only")]
    PingTooHigh,

    #[error("Server is full")]
    ServerFull,

    #[error("Userinfo string length exceeded.")]
    UserinfoTooLong,

    #[error("{0}")]
    GameRejected(String),
}

impl AdmissionError {
    /// Connectionless reply for this rejection, if the client gets one
    ///
    /// Reconnect floods are dropped without an answer.
    pub fn reply(&self) -> Option<String> {
        match self {
            AdmissionError::ReconnectTooSoon => None,
            other => Some(format!("print\n{}\n", other)),
        }
    }
}

/// Fatal conditions for a single connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("illegible client message")]
    ProtocolViolation,

    #[error("Lost reliable commands")]
    LostCommands,

    #[error("Server command overflow")]
    ReliableOverflow,

    #[error("Unpure client detected: invalid .pk3 files referenced!")]
    Integrity(#[source] PureCheckError),

    #[error("Cannot validate pure client!")]
    Unvalidated,

    #[error("broken download")]
    BrokenDownload,

    #[error("userinfo string length exceeded")]
    UserinfoOverflow,
}

impl SlotError {
    /// Text delivered to the client in its final `disconnect` command
    pub fn drop_reason(&self) -> String {
        self.to_string()
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error(transparent)]
    Packet(#[from] PacketError),
}
