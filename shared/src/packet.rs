//! Datagram framing and the message codec
//!
//! Two kinds of datagrams share the socket:
//!
//! - Connectionless (out-of-band) datagrams start with four `0xff` bytes and
//!   carry a newline terminated ASCII command such as `getchallenge`.
//! - Sequenced datagrams start with a little-endian `i32` sequence number.
//!   Client datagrams follow it with a `u16` qport that disambiguates several
//!   clients behind one address; the rest is a bincode encoded message.
//!
//! The message bodies are opaque to the connection layer: it only reads and
//! writes them through the functions in this module.

use crate::UserCmd;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leading marker of every connectionless datagram (an `i32` of -1)
pub const OOB_MARKER: [u8; 4] = [0xff; 4];

const CLIENT_HEADER_LEN: usize = 6;
const SERVER_HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// A sequenced reliable text command, in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableCommand {
    pub sequence: i32,
    pub text: String,
}

/// A batch of user commands; older commands are repeated to survive loss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMove {
    /// Whether the client wants delta compressed snapshots
    pub delta: bool,
    pub cmds: Vec<UserCmd>,
}

/// Body of a sequenced client datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Game epoch the client believes it is in
    pub server_id: i32,
    /// Last server message sequence the client received
    pub message_acknowledge: i32,
    /// Last server reliable command the client executed
    pub reliable_acknowledge: i32,
    pub commands: Vec<ReliableCommand>,
    pub movement: Option<UserMove>,
}

/// Configuration strings and entity baselines for one connection epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gamestate {
    pub reliable_sequence: i32,
    pub config_strings: Vec<(u16, String)>,
    pub baselines: Vec<Baseline>,
    pub client_num: u16,
    pub checksum_feed: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub number: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub server_time: u64,
    /// Message the snapshot is delta compressed against, if any
    pub delta_from: Option<i32>,
    /// Opaque world state produced by the game rules
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadBlock {
    pub block: u32,
    /// Only present on block zero
    pub file_size: Option<u64>,
    /// Empty on the terminal block
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerOp {
    Gamestate(Gamestate),
    Snapshot(Snapshot),
    Download(DownloadBlock),
    DownloadRefused { message: String },
}

/// Body of a sequenced server datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Last client reliable command the server executed
    pub reliable_acknowledge: i32,
    /// Every server reliable command the client has not acknowledged yet
    pub commands: Vec<ReliableCommand>,
    pub ops: Vec<ServerOp>,
}

pub fn is_connectionless(data: &[u8]) -> bool {
    data.len() >= OOB_MARKER.len() && data[..OOB_MARKER.len()] == OOB_MARKER
}

/// Builds a connectionless datagram
pub fn encode_oob(text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(OOB_MARKER.len() + text.len());
    data.extend_from_slice(&OOB_MARKER);
    data.extend_from_slice(text.as_bytes());
    data
}

/// Returns the text of a connectionless datagram, stopping at a NUL byte
pub fn decode_oob(data: &[u8]) -> Option<String> {
    if !is_connectionless(data) {
        return None;
    }
    let body = &data[OOB_MARKER.len()..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    Some(String::from_utf8_lossy(&body[..end]).into_owned())
}

/// First line of a connectionless command, where the request itself lives
pub fn command_line(text: &str) -> &str {
    text.split('\n').next().unwrap_or("")
}

pub fn encode_client_packet(
    sequence: i32,
    qport: u16,
    message: &ClientMessage,
) -> Result<Vec<u8>, PacketError> {
    let body = serialize(message)?;
    let mut data = Vec::with_capacity(CLIENT_HEADER_LEN + body.len());
    data.extend_from_slice(&sequence.to_le_bytes());
    data.extend_from_slice(&qport.to_le_bytes());
    data.extend_from_slice(&body);
    Ok(data)
}

/// Reads the sequence number and qport without touching the body
pub fn read_client_header(data: &[u8]) -> Result<(i32, u16), PacketError> {
    if data.len() < CLIENT_HEADER_LEN {
        return Err(PacketError::Truncated(data.len()));
    }
    let sequence = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let qport = u16::from_le_bytes([data[4], data[5]]);
    Ok((sequence, qport))
}

pub fn decode_client_body(data: &[u8]) -> Result<ClientMessage, PacketError> {
    if data.len() < CLIENT_HEADER_LEN {
        return Err(PacketError::Truncated(data.len()));
    }
    Ok(deserialize(&data[CLIENT_HEADER_LEN..])?)
}

pub fn encode_server_packet(
    sequence: i32,
    message: &ServerMessage,
) -> Result<Vec<u8>, PacketError> {
    let body = serialize(message)?;
    let mut data = Vec::with_capacity(SERVER_HEADER_LEN + body.len());
    data.extend_from_slice(&sequence.to_le_bytes());
    data.extend_from_slice(&body);
    Ok(data)
}

pub fn decode_server_packet(data: &[u8]) -> Result<(i32, ServerMessage), PacketError> {
    if data.len() < SERVER_HEADER_LEN {
        return Err(PacketError::Truncated(data.len()));
    }
    let sequence = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let message = deserialize(&data[SERVER_HEADER_LEN..])?;
    Ok((sequence, message))
}
