//! Server settings
//!
//! `ServerConfig` doubles as the command line of the `server` binary, so every
//! setting can be overridden with a flag and `ServerConfig::default()` yields
//! the same values the binary starts with.

use clap::Parser;
use shared::PORT_SERVER;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Authoritative UDP game server")]
pub struct ServerConfig {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// UDP port to listen on
    #[clap(short, long, default_value_t = PORT_SERVER)]
    pub port: u16,

    /// Number of client slots
    #[clap(long, default_value_t = 16)]
    pub max_clients: usize,

    /// Slots reserved for clients presenting the private password
    #[clap(long, default_value_t = 0)]
    pub private_clients: usize,

    #[clap(long, default_value = "")]
    pub private_password: String,

    /// Simulation frames per second
    #[clap(long, default_value_t = 20)]
    pub fps: u32,

    /// Seconds of silence before a client is dropped
    #[clap(long, default_value_t = 200)]
    pub timeout: u64,

    /// Seconds a dropped client lingers to deliver its final disconnect notice
    #[clap(long, default_value_t = 2)]
    pub zombie_time: u64,

    /// Seconds a connection must wait before connecting again
    #[clap(long, default_value_t = 3)]
    pub reconnect_limit: u64,

    /// Minimum challenge ping in milliseconds, 0 disables
    #[clap(long, default_value_t = 0)]
    pub min_ping: u64,

    /// Maximum challenge ping in milliseconds, 0 disables
    #[clap(long, default_value_t = 0)]
    pub max_ping: u64,

    /// Simultaneous connections allowed from one IP, 0 disables
    #[clap(long, default_value_t = 3)]
    pub clients_per_ip: usize,

    /// Refuse clients without a well formed cl_guid
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub check_client_guid: bool,

    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub flood_protect: bool,

    /// Reliable client commands executed per 1.5 second window
    #[clap(long, default_value_t = 2)]
    pub flood_burst: u32,

    /// Require clients to prove they run the server's archives
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub pure: bool,

    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_download: bool,

    /// Lower bound on client rate in bytes per second, 0 disables
    #[clap(long, default_value_t = 0)]
    pub min_rate: u32,

    /// Upper bound on client rate in bytes per second, 0 disables
    #[clap(long, default_value_t = 0)]
    pub max_rate: u32,

    /// Give LAN clients an unlimited rate
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub lan_force_rate: bool,

    #[clap(long, default_value = "noname")]
    pub hostname: String,

    #[clap(long, default_value = "arena")]
    pub map: String,

    #[clap(long, default_value_t = 0)]
    pub gametype: i32,

    /// Remote console password, empty disables rcon
    #[clap(long, default_value = "")]
    pub rcon_password: String,

    /// Host allowed to issue rcon commands without throttling
    #[clap(long)]
    pub rcon_allowed_ip: Option<String>,

    /// Announce the server to the directory servers
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub public: bool,

    /// Directory server to send heartbeats to (repeatable)
    #[clap(long = "master")]
    pub masters: Vec<String>,

    #[clap(long, default_value = "QuakeArena-1")]
    pub heartbeat_game: String,

    /// Host whose ipauthorize verdicts are trusted
    #[clap(long)]
    pub authorize_server: Option<String>,

    /// Directory holding the downloadable .pk3 archives
    #[clap(long)]
    pub content_dir: Option<PathBuf>,

    /// Archive name prefix marking official content (repeatable)
    #[clap(long = "official-prefix", default_value = "pak")]
    pub official_prefixes: Vec<String>,

    /// Root for persisted player state
    #[clap(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Save and restore player positions across connections
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub persistent_positions: bool,

    /// Directory for server side demos
    #[clap(long, default_value = "demos")]
    pub demo_dir: PathBuf,

    #[clap(long, default_value_t = 1024)]
    pub max_challenges: usize,

    #[clap(long, default_value_t = 48)]
    pub max_info_receipts: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["server"])
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Length of one simulation frame
    pub fn frame_msec(&self) -> u64 {
        (1000 / self.fps.max(1) as u64).max(1)
    }

    /// Effective rate bounds; configured values below 1000 are raised to 1000
    pub fn rate_bounds(&self) -> (Option<u32>, Option<u32>) {
        let clamp = |v: u32| if v == 0 { None } else { Some(v.max(1000)) };
        (clamp(self.min_rate), clamp(self.max_rate))
    }

    /// Slots visible to the public
    pub fn public_clients(&self) -> usize {
        self.max_clients.saturating_sub(self.private_clients)
    }
}
