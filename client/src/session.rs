//! Client side of the connection protocol, without I/O
//!
//! `ClientSession` follows the same shape as the server context: datagrams go
//! in through `handle_datagram`, time advances through `frame`, and whatever
//! the client wants to send is collected until `take_outgoing`.

use crate::error::ClientError;
use log::{debug, info, warn};
use rand::Rng;
use shared::command::{quote, tokenize};
use shared::packet::{
    command_line, decode_oob, decode_server_packet, encode_client_packet, encode_oob,
    is_connectionless, ClientMessage, DownloadBlock, Gamestate, ReliableCommand, ServerMessage,
    ServerOp, UserMove,
};
use shared::pure::pure_report;
use shared::{InfoString, UserCmd, CS_SYSTEMINFO, MAX_RELIABLE_COMMANDS, PROTOCOL_VERSION};
use std::collections::{BTreeMap, VecDeque};

/// Interval between challenge and connect retries
pub const CONNECT_RESEND_MSEC: u64 = 3000;

/// Silence after which the client gives up on the server
pub const SERVER_TIMEOUT_MSEC: u64 = 60_000;

/// User commands repeated in every movement batch
const CMD_BACKUP: usize = 3;

/// Settings of one client connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub guid: String,
    pub qport: u16,
    pub rate: u32,
    pub snaps: u32,
    /// Archives to fetch after the first gamestate
    pub downloads: Vec<String>,
}

impl ClientConfig {
    /// A config with a random GUID and qport
    pub fn new(name: &str) -> Self {
        let mut rng = rand::thread_rng();
        let guid: String = (0..shared::GUID_LENGTH)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect::<String>()
            .to_ascii_uppercase();
        Self {
            name: name.to_string(),
            guid,
            qport: rng.gen(),
            rate: 25000,
            snaps: 20,
            downloads: Vec::new(),
        }
    }

    /// Userinfo sent with the connect request and `userinfo` updates
    pub fn userinfo(&self) -> InfoString {
        let mut info = InfoString::new();
        let pairs = [
            ("name", self.name.clone()),
            ("rate", self.rate.to_string()),
            ("snaps", self.snaps.to_string()),
            ("cl_guid", self.guid.clone()),
        ];
        for (key, value) in pairs {
            if let Err(e) = info.set(key, &value) {
                warn!("Userinfo {} not set: {}", key, e);
            }
        }
        info
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for `challengeResponse`
    Challenging,
    /// Waiting for `connectResponse`
    Connecting,
    /// Admitted, waiting for a gamestate
    Connected,
    /// Gamestate received, not yet in the world
    Primed,
    /// Receiving snapshots
    Active,
    Disconnected(String),
}

/// A finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Transfer {
    name: String,
    expected_block: u32,
    size: Option<u64>,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct ClientSession {
    pub config: ClientConfig,
    pub state: ConnectionState,
    /// Client clock in milliseconds
    pub time: u64,
    challenge: i32,
    next_resend: u64,
    last_packet_time: u64,

    // Sequenced channel
    outgoing_sequence: i32,
    incoming_sequence: i32,

    // Reliable commands in both directions
    reliable_sequence: i32,
    reliable_acknowledge: i32,
    pending_commands: VecDeque<ReliableCommand>,
    server_command_sequence: i32,
    executed: Vec<String>,

    // Gamestate
    server_id: i32,
    checksum_feed: i32,
    client_num: Option<u16>,
    config_strings: BTreeMap<u16, String>,
    gamestates: u32,
    pure_reported: bool,

    // World
    snapshots: u32,
    snapshot_time: u64,
    cmd_time: u64,
    cmds: VecDeque<UserCmd>,

    // Downloads
    download_queue: VecDeque<String>,
    transfer: Option<Transfer>,
    downloads_started: bool,
    downloads_done: bool,
    completed: Vec<Download>,
    refusals: Vec<String>,

    outbox: Vec<Vec<u8>>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            download_queue: config.downloads.iter().cloned().collect(),
            downloads_done: config.downloads.is_empty(),
            config,
            state: ConnectionState::Challenging,
            time: 0,
            challenge: 0,
            next_resend: 0,
            last_packet_time: 0,
            outgoing_sequence: 1,
            incoming_sequence: 0,
            reliable_sequence: 0,
            reliable_acknowledge: 0,
            pending_commands: VecDeque::new(),
            server_command_sequence: 0,
            executed: Vec::new(),
            server_id: 0,
            checksum_feed: 0,
            client_num: None,
            config_strings: BTreeMap::new(),
            gamestates: 0,
            pure_reported: false,
            snapshots: 0,
            snapshot_time: 0,
            cmd_time: 0,
            cmds: VecDeque::new(),
            transfer: None,
            downloads_started: false,
            completed: Vec::new(),
            refusals: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    pub fn client_num(&self) -> Option<u16> {
        self.client_num
    }

    pub fn config_string(&self, index: u16) -> &str {
        self.config_strings
            .get(&index)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Server commands executed so far, in order
    pub fn executed_commands(&self) -> &[String] {
        &self.executed
    }

    pub fn gamestates(&self) -> u32 {
        self.gamestates
    }

    pub fn snapshots(&self) -> u32 {
        self.snapshots
    }

    pub fn completed_downloads(&self) -> &[Download] {
        &self.completed
    }

    pub fn download_refusals(&self) -> &[String] {
        &self.refusals
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, ConnectionState::Disconnected(_))
    }

    /// Queues a reliable command for the server
    pub fn add_command(&mut self, text: &str) -> Result<(), ClientError> {
        if self.reliable_sequence - self.reliable_acknowledge >= MAX_RELIABLE_COMMANDS as i32 {
            return Err(ClientError::CommandOverflow);
        }
        self.reliable_sequence += 1;
        self.pending_commands.push_back(ReliableCommand {
            sequence: self.reliable_sequence,
            text: text.to_string(),
        });
        Ok(())
    }

    fn queue_command(&mut self, text: &str) {
        if let Err(e) = self.add_command(text) {
            warn!("Dropped command {:?}: {}", text, e);
        }
    }

    /// Sends changed userinfo to the server
    pub fn update_userinfo(&mut self) {
        let userinfo = self.config.userinfo();
        self.queue_command(&format!("userinfo {}", quote(&userinfo.to_string())));
    }

    /// Advances the clock and produces this frame's datagrams
    pub fn frame(&mut self, msec: u64) {
        self.time += msec;
        let now = self.time;

        match self.state {
            ConnectionState::Challenging | ConnectionState::Connecting => {
                if now >= self.next_resend {
                    self.next_resend = now + CONNECT_RESEND_MSEC;
                    self.send_connect_packet();
                }
            }
            ConnectionState::Connected | ConnectionState::Primed | ConnectionState::Active => {
                if now.saturating_sub(self.last_packet_time) > SERVER_TIMEOUT_MSEC {
                    warn!("Server connection timed out");
                    self.state = ConnectionState::Disconnected("timed out".to_string());
                    return;
                }
                self.check_downloads();
                self.send_message();
            }
            ConnectionState::Disconnected(_) => {}
        }
    }

    fn send_connect_packet(&mut self) {
        let text = match self.state {
            ConnectionState::Challenging => "getchallenge".to_string(),
            ConnectionState::Connecting => {
                let mut userinfo = self.config.userinfo();
                let pairs = [
                    ("protocol", PROTOCOL_VERSION.to_string()),
                    ("qport", self.config.qport.to_string()),
                    ("challenge", self.challenge.to_string()),
                ];
                for (key, value) in pairs {
                    if let Err(e) = userinfo.set(key, &value) {
                        warn!("Connect userinfo {} not set: {}", key, e);
                    }
                }
                format!("connect {}", quote(&userinfo.to_string()))
            }
            _ => return,
        };
        debug!("Sending {}", command_line(&text));
        self.outbox.push(encode_oob(&text));
    }

    /// Whether the client may send movement and enter the world
    fn ready_for_world(&self) -> bool {
        self.state >= ConnectionState::Primed
            && self.downloads_done
            && self.transfer.is_none()
            && (!self.pure() || self.pure_reported)
    }

    fn pure(&self) -> bool {
        InfoString::parse(self.config_string(CS_SYSTEMINFO)).value("sv_pure") == "1"
    }

    fn send_message(&mut self) {
        let movement = if self.ready_for_world() {
            self.cmd_time = (self.cmd_time + 1).max(self.snapshot_time);
            let cmd = UserCmd {
                server_time: self.cmd_time,
                angles: [0.0, (self.time / 10 % 360) as f32, 0.0],
                forward: 127,
                ..UserCmd::default()
            };
            self.cmds.push_back(cmd);
            while self.cmds.len() > CMD_BACKUP {
                self.cmds.pop_front();
            }
            Some(UserMove {
                delta: false,
                cmds: self.cmds.iter().copied().collect(),
            })
        } else {
            None
        };

        let message = ClientMessage {
            server_id: self.server_id,
            message_acknowledge: self.incoming_sequence,
            reliable_acknowledge: self.server_command_sequence,
            commands: self.pending_commands.iter().cloned().collect(),
            movement,
        };
        match encode_client_packet(self.outgoing_sequence, self.config.qport, &message) {
            Ok(data) => {
                self.outgoing_sequence += 1;
                self.outbox.push(data);
            }
            Err(e) => warn!("Could not encode client message: {}", e),
        }
    }

    /// Processes one datagram from the server
    pub fn handle_datagram(&mut self, data: &[u8]) {
        if is_connectionless(data) {
            if let Some(text) = decode_oob(data) {
                self.connectionless_packet(&text);
            }
            return;
        }

        if self.state < ConnectionState::Connected || self.is_disconnected() {
            return;
        }
        let (sequence, message) = match decode_server_packet(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Dropped server packet: {}", e);
                return;
            }
        };
        if sequence <= self.incoming_sequence {
            debug!("Out of order packet {} at {}", sequence, self.incoming_sequence);
            return;
        }
        if sequence > self.incoming_sequence + 1 {
            debug!("Dropped {} packets", sequence - self.incoming_sequence - 1);
        }
        self.incoming_sequence = sequence;
        self.last_packet_time = self.time;
        self.parse_server_message(message);
    }

    fn connectionless_packet(&mut self, text: &str) {
        let line = command_line(text);
        let args = tokenize(line);
        let Some(command) = args.first() else {
            return;
        };

        match command.as_str() {
            "challengeResponse" => {
                if self.state != ConnectionState::Challenging {
                    return;
                }
                let Some(token) = args.get(1).and_then(|t| t.parse().ok()) else {
                    return;
                };
                debug!("Got challenge {}", token);
                self.challenge = token;
                self.state = ConnectionState::Connecting;
                self.next_resend = self.time + CONNECT_RESEND_MSEC;
                self.send_connect_packet();
            }
            "connectResponse" => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                info!("Connected to server");
                self.state = ConnectionState::Connected;
                self.last_packet_time = self.time;
                self.outgoing_sequence = 1;
                self.incoming_sequence = 0;
            }
            "print" => {
                let body = text.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
                let body = body.trim_end();
                info!("Server: {}", body);
                if matches!(
                    self.state,
                    ConnectionState::Challenging | ConnectionState::Connecting
                ) {
                    self.state = ConnectionState::Disconnected(body.to_string());
                }
            }
            "disconnect" => {
                if self.state >= ConnectionState::Connected && !self.is_disconnected() {
                    info!("Server disconnected");
                    self.state = ConnectionState::Disconnected("server disconnected".to_string());
                }
            }
            other => debug!("Ignored connectionless {}", other),
        }
    }

    fn parse_server_message(&mut self, message: ServerMessage) {
        while self
            .pending_commands
            .front()
            .is_some_and(|c| c.sequence <= message.reliable_acknowledge)
        {
            self.pending_commands.pop_front();
        }
        self.reliable_acknowledge = self.reliable_acknowledge.max(message.reliable_acknowledge);

        let (gamestates, ops): (Vec<_>, Vec<_>) = message
            .ops
            .into_iter()
            .partition(|op| matches!(op, ServerOp::Gamestate(_)));
        for op in gamestates {
            if let ServerOp::Gamestate(gamestate) = op {
                self.parse_gamestate(gamestate);
            }
        }

        for command in message.commands {
            if command.sequence <= self.server_command_sequence {
                continue;
            }
            self.server_command_sequence = command.sequence;
            self.execute_server_command(&command.text);
            if self.is_disconnected() {
                return;
            }
        }

        for op in ops {
            match op {
                ServerOp::Gamestate(_) => {}
                ServerOp::Snapshot(snapshot) => {
                    self.snapshots += 1;
                    self.snapshot_time = snapshot.server_time;
                    if self.state == ConnectionState::Primed {
                        info!("Entered the world");
                        self.state = ConnectionState::Active;
                    }
                }
                ServerOp::Download(block) => self.download_block(block),
                ServerOp::DownloadRefused { message } => {
                    warn!("Download refused: {}", message);
                    self.refusals.push(message);
                    self.transfer = None;
                }
            }
        }
    }

    fn parse_gamestate(&mut self, gamestate: Gamestate) {
        self.gamestates += 1;
        self.server_command_sequence = gamestate.reliable_sequence;
        self.config_strings = gamestate.config_strings.into_iter().collect();
        self.checksum_feed = gamestate.checksum_feed;
        self.client_num = Some(gamestate.client_num);
        self.refresh_server_id();
        self.state = ConnectionState::Primed;
        self.cmds.clear();
        self.pure_reported = false;
        debug!(
            "Gamestate {} for client {} on server id {}",
            self.gamestates, gamestate.client_num, self.server_id
        );

        if self.pure() {
            self.send_pure_report();
        }
        if !self.downloads_started {
            self.downloads_started = true;
            self.start_next_download();
        }
    }

    fn refresh_server_id(&mut self) {
        let system = InfoString::parse(self.config_string(CS_SYSTEMINFO));
        if let Ok(id) = system.value("sv_serverid").parse() {
            self.server_id = id;
        }
    }

    /// Reports every archive the server announced as loaded
    fn send_pure_report(&mut self) {
        let system = InfoString::parse(self.config_string(CS_SYSTEMINFO));
        let paks: Vec<i32> = system
            .value("sv_paks")
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect();
        let (cgame, ui) = match paks.as_slice() {
            [cgame, ui, ..] => (*cgame, *ui),
            _ => (0, 0),
        };
        let report = pure_report(self.server_id, cgame, ui, &paks, self.checksum_feed);
        self.queue_command(&report);
        self.pure_reported = true;
    }

    fn execute_server_command(&mut self, text: &str) {
        self.executed.push(text.to_string());
        let args = tokenize(text);
        let Some(command) = args.first() else {
            return;
        };

        match command.as_str() {
            "print" | "chat" => {
                let text = args.get(1).map(String::as_str).unwrap_or("");
                info!("{}", text.trim_end());
            }
            "cs" => {
                let Some(index) = args.get(1).and_then(|i| i.parse::<u16>().ok()) else {
                    return;
                };
                let value = args.get(2).cloned().unwrap_or_default();
                self.config_strings.insert(index, value);
                if index == CS_SYSTEMINFO {
                    self.refresh_server_id();
                }
            }
            "map_restart" => {
                debug!("Map restarted");
                self.cmds.clear();
                self.cmd_time = 0;
            }
            "disconnect" => {
                let reason = args.get(1).cloned().unwrap_or_default();
                info!("Disconnected by server: {}", reason);
                self.state = ConnectionState::Disconnected(reason);
            }
            other => debug!("Unhandled server command {}", other),
        }
    }

    fn start_next_download(&mut self) {
        match self.download_queue.pop_front() {
            Some(name) => {
                info!("Downloading {}", name);
                self.queue_command(&format!("download {}", name));
                self.transfer = Some(Transfer {
                    name,
                    expected_block: 0,
                    size: None,
                    data: Vec::new(),
                });
            }
            None => {
                if !self.downloads_done {
                    self.downloads_done = true;
                    self.queue_command("donedl");
                }
            }
        }
    }

    /// Moves on once a transfer was refused
    fn check_downloads(&mut self) {
        if self.downloads_started && self.transfer.is_none() && !self.downloads_done {
            self.start_next_download();
        }
    }

    fn download_block(&mut self, block: DownloadBlock) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        if block.block != transfer.expected_block {
            return;
        }
        if let Some(size) = block.file_size {
            transfer.size = Some(size);
        }
        transfer.expected_block += 1;
        let finished = block.data.is_empty();
        transfer.data.extend_from_slice(&block.data);
        self.queue_command(&format!("nextdl {}", block.block));

        if finished {
            if let Some(transfer) = self.transfer.take() {
                if transfer.size.is_some_and(|size| size != transfer.data.len() as u64) {
                    warn!(
                        "Download {} is {} bytes, expected {:?}",
                        transfer.name,
                        transfer.data.len(),
                        transfer.size
                    );
                }
                info!("Finished download of {}", transfer.name);
                self.completed.push(Download {
                    name: transfer.name,
                    data: transfer.data,
                });
            }
            self.start_next_download();
        }
    }

    /// Sends `disconnect` in a final burst of messages
    pub fn disconnect(&mut self) {
        if self.state >= ConnectionState::Connected && !self.is_disconnected() {
            self.queue_command("disconnect");
            for _ in 0..3 {
                self.send_message();
            }
        }
        self.state = ConnectionState::Disconnected("disconnected".to_string());
    }
}

impl PartialOrd for ConnectionState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.rank().cmp(&other.rank()))
    }
}

impl ConnectionState {
    /// Error describing why a session ended, if it did
    pub fn error(&self) -> Option<ClientError> {
        match self {
            ConnectionState::Disconnected(reason) => Some(ClientError::Disconnected(reason.clone())),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ConnectionState::Disconnected(_) => 0,
            ConnectionState::Challenging => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Primed => 4,
            ConnectionState::Active => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::packet::{decode_client_body, encode_server_packet, read_client_header, Snapshot};

    const QPORT: u16 = 4242;

    fn session_with(mut config: ClientConfig) -> ClientSession {
        config.qport = QPORT;
        ClientSession::new(config)
    }

    fn session() -> ClientSession {
        session_with(ClientConfig::new("tester"))
    }

    fn oob_texts(session: &mut ClientSession) -> Vec<String> {
        session
            .take_outgoing()
            .iter()
            .filter_map(|d| decode_oob(d))
            .collect()
    }

    fn client_messages(session: &mut ClientSession) -> Vec<(i32, ClientMessage)> {
        session
            .take_outgoing()
            .iter()
            .filter(|d| !is_connectionless(d))
            .map(|d| {
                let (sequence, qport) = read_client_header(d).unwrap();
                assert_eq!(qport, QPORT);
                (sequence, decode_client_body(d).unwrap())
            })
            .collect()
    }

    fn server_packet(sequence: i32, message: &ServerMessage) -> Vec<u8> {
        encode_server_packet(sequence, message).unwrap()
    }

    fn gamestate(server_id: i32, reliable_sequence: i32, system: &str) -> ServerMessage {
        ServerMessage {
            reliable_acknowledge: 0,
            commands: vec![],
            ops: vec![ServerOp::Gamestate(Gamestate {
                reliable_sequence,
                config_strings: vec![
                    (0, "\\mapname\\arena".to_string()),
                    (1, format!("\\sv_serverid\\{}{}", server_id, system)),
                ],
                baselines: vec![],
                client_num: 2,
                checksum_feed: 77,
            })],
        }
    }

    fn connected() -> ClientSession {
        let mut session = session();
        session.frame(10);
        session.handle_datagram(&encode_oob("challengeResponse 99"));
        session.handle_datagram(&encode_oob("connectResponse"));
        session.take_outgoing();
        session
    }

    #[test]
    fn test_handshake_sends_challenge_then_connect() {
        let mut session = session();
        session.frame(10);
        assert_eq!(oob_texts(&mut session), vec!["getchallenge"]);

        session.handle_datagram(&encode_oob("challengeResponse 1234"));
        assert_eq!(session.state, ConnectionState::Connecting);
        let texts = oob_texts(&mut session);
        let args = tokenize(&texts[0]);
        assert_eq!(args[0], "connect");
        let userinfo = InfoString::parse(&args[1]);
        assert_eq!(userinfo.value("challenge"), "1234");
        assert_eq!(userinfo.value("qport"), "4242");
        assert_eq!(userinfo.value("protocol"), PROTOCOL_VERSION.to_string());
        assert_eq!(userinfo.value("name"), "tester");
        assert!(shared::is_valid_guid(userinfo.value("cl_guid")));

        session.handle_datagram(&encode_oob("connectResponse"));
        assert_eq!(session.state, ConnectionState::Connected);
    }

    #[test]
    fn test_challenge_is_resent() {
        let mut session = session();
        session.frame(10);
        session.take_outgoing();
        session.frame(1000);
        assert!(session.take_outgoing().is_empty());
        session.frame(CONNECT_RESEND_MSEC);
        assert_eq!(oob_texts(&mut session), vec!["getchallenge"]);
    }

    #[test]
    fn test_rejection_ends_the_attempt() {
        let mut session = session();
        session.frame(10);
        session.handle_datagram(&encode_oob("challengeResponse 5"));
        session.handle_datagram(&encode_oob("print\nServer is full\n"));
        assert_eq!(
            session.state,
            ConnectionState::Disconnected("Server is full".to_string())
        );
    }

    #[test]
    fn test_gamestate_sets_server_id_and_skips_old_commands() {
        let mut session = connected();
        let mut message = gamestate(31, 4, "\\sv_pure\\0");
        message.commands = vec![ReliableCommand {
            sequence: 4,
            text: "print \"old\"".to_string(),
        }];
        session.handle_datagram(&server_packet(1, &message));

        assert_eq!(session.state, ConnectionState::Primed);
        assert_eq!(session.server_id(), 31);
        assert_eq!(session.client_num(), Some(2));
        assert!(session.executed_commands().is_empty());

        session.frame(10);
        let messages = client_messages(&mut session);
        let (sequence, msg) = &messages[0];
        assert_eq!(*sequence, 1);
        assert_eq!(msg.server_id, 31);
        assert_eq!(msg.message_acknowledge, 1);
        assert_eq!(msg.reliable_acknowledge, 4);
        assert!(msg.movement.is_some());
    }

    #[test]
    fn test_reliable_commands_execute_once_and_ack() {
        let mut session = connected();
        session.handle_datagram(&server_packet(1, &gamestate(3, 0, "")));

        let cs = ServerMessage {
            reliable_acknowledge: 0,
            commands: vec![
                ReliableCommand {
                    sequence: 1,
                    text: "cs 1 \"\\sv_serverid\\4\"".to_string(),
                },
                ReliableCommand {
                    sequence: 2,
                    text: "map_restart".to_string(),
                },
            ],
            ops: vec![],
        };
        session.handle_datagram(&server_packet(2, &cs));
        // Retransmitted with a newer sequence, already executed
        session.handle_datagram(&server_packet(3, &cs));

        assert_eq!(session.executed_commands().len(), 2);
        assert_eq!(session.server_id(), 4);

        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        assert_eq!(msg.reliable_acknowledge, 2);
    }

    #[test]
    fn test_stale_packets_are_dropped() {
        let mut session = connected();
        session.handle_datagram(&server_packet(5, &gamestate(3, 0, "")));
        session.handle_datagram(&server_packet(4, &gamestate(9, 0, "")));
        assert_eq!(session.server_id(), 3);
        assert_eq!(session.gamestates(), 1);
    }

    #[test]
    fn test_pending_commands_drop_after_ack() {
        let mut session = connected();
        session.handle_datagram(&server_packet(1, &gamestate(3, 0, "")));
        session.add_command("say hi").unwrap();
        session.add_command("say again").unwrap();

        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        assert_eq!(msg.commands.len(), 2);

        let ack = ServerMessage {
            reliable_acknowledge: 1,
            commands: vec![],
            ops: vec![],
        };
        session.handle_datagram(&server_packet(2, &ack));
        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        assert_eq!(msg.commands.len(), 1);
        assert_eq!(msg.commands[0].text, "say again");
    }

    #[test]
    fn test_command_overflow() {
        let mut session = connected();
        for _ in 0..MAX_RELIABLE_COMMANDS {
            session.add_command("score").unwrap();
        }
        assert!(matches!(
            session.add_command("score"),
            Err(ClientError::CommandOverflow)
        ));
    }

    #[test]
    fn test_pure_report_uses_announced_archives() {
        let mut session = connected();
        let system = "\\sv_pure\\1\\sv_paks\\11 22 33";
        session.handle_datagram(&server_packet(1, &gamestate(8, 0, system)));

        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        assert_eq!(msg.commands[0].text, pure_report(8, 11, 22, &[11, 22, 33], 77));
        assert!(msg.movement.is_some());
    }

    #[test]
    fn test_snapshot_activates_and_sets_command_time() {
        let mut session = connected();
        session.handle_datagram(&server_packet(1, &gamestate(3, 0, "")));
        let snapshot = ServerMessage {
            reliable_acknowledge: 0,
            commands: vec![],
            ops: vec![ServerOp::Snapshot(Snapshot {
                server_time: 5000,
                delta_from: None,
                payload: vec![],
            })],
        };
        session.handle_datagram(&server_packet(2, &snapshot));
        assert_eq!(session.state, ConnectionState::Active);

        session.frame(10);
        session.frame(10);
        let messages = client_messages(&mut session);
        let cmds = &messages[1].1.movement.as_ref().unwrap().cmds;
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].server_time, 5000);
        assert_eq!(cmds[1].server_time, 5001);
    }

    #[test]
    fn test_download_blocks_are_acknowledged_in_order() {
        let mut config = ClientConfig::new("getter");
        config.downloads = vec!["custom.pk3".to_string()];
        let mut session = session_with(config);
        session.frame(10);
        session.handle_datagram(&encode_oob("challengeResponse 1"));
        session.handle_datagram(&encode_oob("connectResponse"));
        session.handle_datagram(&server_packet(1, &gamestate(3, 0, "")));

        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        assert_eq!(msg.commands[0].text, "download custom.pk3");
        assert!(msg.movement.is_none());

        let blocks = |blocks: Vec<DownloadBlock>| ServerMessage {
            reliable_acknowledge: 1,
            commands: vec![],
            ops: blocks.into_iter().map(ServerOp::Download).collect(),
        };
        session.handle_datagram(&server_packet(
            2,
            &blocks(vec![
                DownloadBlock {
                    block: 0,
                    file_size: Some(3),
                    data: vec![1, 2, 3],
                },
                // Out of window, ignored
                DownloadBlock {
                    block: 5,
                    file_size: None,
                    data: vec![9],
                },
            ]),
        ));
        session.handle_datagram(&server_packet(
            3,
            &blocks(vec![DownloadBlock {
                block: 1,
                file_size: None,
                data: vec![],
            }]),
        ));

        assert_eq!(
            session.completed_downloads(),
            &[Download {
                name: "custom.pk3".to_string(),
                data: vec![1, 2, 3],
            }]
        );

        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        let texts: Vec<&str> = msg.commands.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["nextdl 0", "nextdl 1", "donedl"]);
        assert!(msg.movement.is_some());
    }

    #[test]
    fn test_refused_download_moves_on() {
        let mut config = ClientConfig::new("getter");
        config.downloads = vec!["pak0.pk3".to_string()];
        let mut session = session_with(config);
        session.frame(10);
        session.handle_datagram(&encode_oob("challengeResponse 1"));
        session.handle_datagram(&encode_oob("connectResponse"));
        session.handle_datagram(&server_packet(1, &gamestate(3, 0, "")));

        let refused = ServerMessage {
            reliable_acknowledge: 1,
            commands: vec![],
            ops: vec![ServerOp::DownloadRefused {
                message: "Cannot autodownload official archive \"pak0.pk3\"".to_string(),
            }],
        };
        session.handle_datagram(&server_packet(2, &refused));
        assert_eq!(session.download_refusals().len(), 1);

        session.frame(10);
        let (_, msg) = &client_messages(&mut session)[0];
        assert_eq!(msg.commands.last().unwrap().text, "donedl");
    }

    #[test]
    fn test_disconnect_command_ends_session() {
        let mut session = connected();
        let message = ServerMessage {
            reliable_acknowledge: 0,
            commands: vec![ReliableCommand {
                sequence: 1,
                text: "disconnect \"was kicked\"".to_string(),
            }],
            ops: vec![],
        };
        session.handle_datagram(&server_packet(1, &message));
        assert_eq!(
            session.state,
            ConnectionState::Disconnected("was kicked".to_string())
        );
    }

    #[test]
    fn test_client_disconnect_sends_command_burst() {
        let mut session = connected();
        session.handle_datagram(&server_packet(1, &gamestate(3, 0, "")));
        session.disconnect();
        let messages = client_messages(&mut session);
        assert_eq!(messages.len(), 3);
        assert!(messages
            .iter()
            .all(|(_, m)| m.commands.iter().any(|c| c.text == "disconnect")));
    }

    #[test]
    fn test_server_silence_times_out() {
        let mut session = connected();
        session.frame(SERVER_TIMEOUT_MSEC + 1);
        assert!(session.is_disconnected());
    }
}
