//! # Shared Protocol Vocabulary
//!
//! Types and constants used by both the server and the client. Nothing in
//! this crate performs I/O; it only describes what travels over the wire.
//!
//! ## Modules
//!
//! - `addr`: network addresses tagged with the transport they arrived on
//! - `infostring`: backslash-delimited key/value strings (userinfo, server info)
//! - `command`: tokenizer shared by every text command
//! - `packet`: connectionless framing, sequenced headers and the message codec
//! - `pure`: client side pure-archive report

use serde::{Deserialize, Serialize};

pub mod addr;
pub mod command;
pub mod infostring;
pub mod packet;
pub mod pure;

pub use addr::{AddrKind, NetAddr};
pub use infostring::{InfoError, InfoString, MAX_INFO_STRING};

/// Protocol revision; connects with any other value are refused
pub const PROTOCOL_VERSION: i32 = 68;

/// Default UDP port of the server
pub const PORT_SERVER: u16 = 27960;

/// Default UDP port of a directory (master) server
pub const PORT_MASTER: u16 = 27950;

/// Capacity of each reliable command ring
pub const MAX_RELIABLE_COMMANDS: usize = 64;

/// Longest reliable command text accepted from the server side
pub const MAX_STRING_CHARS: usize = 1024;

/// Largest datagram either side produces
pub const MAX_MSGLEN: usize = 16384;

/// Number of outgoing message frames remembered per client
pub const PACKET_BACKUP: usize = 32;

/// Most user commands accepted in one movement batch
pub const MAX_PACKET_USERCMDS: usize = 32;

/// Download blocks in flight beyond the last acknowledged one
pub const MAX_DOWNLOAD_WINDOW: usize = 8;

/// Size of one download block
pub const MAX_DOWNLOAD_BLKSIZE: usize = 2048;

pub const MAX_CONFIGSTRINGS: usize = 1024;

/// Configuration string holding the server info
pub const CS_SERVERINFO: u16 = 0;

/// Configuration string holding the system info (`sv_serverid`, `sv_pure`)
pub const CS_SYSTEMINFO: u16 = 1;

/// GUIDs are exactly this many hexadecimal characters
pub const GUID_LENGTH: usize = 32;

/// One frame of player input
///
/// Movement axes are signed fractions scaled to `-127..=127`. The server
/// never interprets them itself; they are handed to the game rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCmd {
    /// Server time the client was simulating when it produced this command
    pub server_time: u64,
    /// View angles in degrees (pitch, yaw, roll)
    pub angles: [f32; 3],
    pub buttons: u32,
    pub weapon: u8,
    pub forward: i8,
    pub right: i8,
    pub up: i8,
}

/// Checks the GUID format a client presents in its userinfo: 32 characters
/// of `0-9` and upper case `A-F`
pub fn is_valid_guid(guid: &str) -> bool {
    guid.len() == GUID_LENGTH
        && guid
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_validation() {
        assert!(is_valid_guid("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_guid("0123456789ABCDEF0123456789abcdef"));
        assert!(!is_valid_guid("0123456789ABCDEF"));
        assert!(!is_valid_guid("0123456789ABCDEF0123456789abcdeg"));
        assert!(!is_valid_guid(""));
    }

    #[test]
    fn test_default_user_cmd_is_idle() {
        let cmd = UserCmd::default();
        assert_eq!(cmd.buttons, 0);
        assert_eq!(cmd.forward, 0);
        assert_eq!(cmd.angles, [0.0; 3]);
    }

    #[test]
    fn test_download_window_fits_in_a_message() {
        assert!(MAX_DOWNLOAD_WINDOW * MAX_DOWNLOAD_BLKSIZE <= MAX_MSGLEN);
    }
}
