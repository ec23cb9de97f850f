//! Server state and the frame driver
//!
//! `ServerContext` owns everything that lives for the duration of a running
//! server: the slot table, challenge cache, configuration strings, the clock
//! and the collaborators. It performs no I/O of its own; datagrams go in
//! through `packet_event` and come out of `take_outgoing`, which keeps every
//! operation synchronous and deterministic for a given seed.

use crate::challenge::ChallengeCache;
use crate::client_manager::{ClientManager, ClientState};
use crate::config::ServerConfig;
use crate::content::{ContentStore, DirectoryContent, MemoryContent};
use crate::drdos::InfoReceipts;
use crate::error::{ServerError, SlotError};
use crate::game::{ArenaGame, GameRules};
use crate::persistence::{FileStore, MemoryStore, PlayerStore};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::command::quote;
use shared::packet::{
    decode_client_body, encode_oob, encode_server_packet, is_connectionless, read_client_header,
    ServerMessage,
};
use shared::{
    InfoString, NetAddr, CS_SERVERINFO, CS_SYSTEMINFO, MAX_MSGLEN, MAX_STRING_CHARS,
    PORT_MASTER, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Interval between directory heartbeats
pub const HEARTBEAT_MSEC: u64 = 300_000;

/// Server time after which the map is restarted to keep times small
pub const TIME_WRAP_MSEC: u64 = 0x7000_0000;

/// Simulation step used while a map restart settles
const RESTART_FRAME_MSEC: u64 = 100;

/// A datagram waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: NetAddr,
    pub data: Vec<u8>,
}

/// External systems the connection layer talks to
pub struct Collaborators {
    pub game: Box<dyn GameRules>,
    pub content: Box<dyn ContentStore>,
    pub store: Box<dyn PlayerStore>,
}

impl Collaborators {
    /// Default game rules with no archives and in-memory persistence
    pub fn in_memory() -> Self {
        Self {
            game: Box::new(ArenaGame::new()),
            content: Box::new(MemoryContent::new()),
            store: Box::new(MemoryStore::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Master {
    pub name: String,
    pub addr: Option<SocketAddr>,
}

pub struct ServerContext {
    pub config: ServerConfig,
    /// Milliseconds of simulated time since the server started
    pub time: u64,
    time_residual: u64,
    pub map: String,
    /// Identifier of the current game epoch
    pub server_id: i32,
    /// Epoch before the last map restart; packets in between are stale
    pub restarted_server_id: i32,
    /// Seed for pure report parity, changed on every spawn
    pub checksum_feed: i32,
    pub checksum_feed_server_id: i32,
    pub clients: ClientManager,
    pub challenges: ChallengeCache,
    pub(crate) info_receipts: InfoReceipts,
    pub(crate) config_strings: BTreeMap<u16, String>,
    pub(crate) game: Box<dyn GameRules>,
    pub(crate) content: Box<dyn ContentStore>,
    pub(crate) store: Box<dyn PlayerStore>,
    pub(crate) rng: StdRng,
    pub(crate) bans: Vec<IpAddr>,
    pub(crate) masters: Vec<Master>,
    pub(crate) authorize_addr: Option<SocketAddr>,
    pub(crate) rcon_last_time: Option<u64>,
    pub(crate) rcon_log_time: Option<u64>,
    next_heartbeat: Option<u64>,
    outbox: Vec<Outgoing>,
    in_frame: bool,
}

impl ServerContext {
    /// Creates a server and spawns the configured map
    pub fn new(config: ServerConfig, collaborators: Collaborators, seed: u64) -> Self {
        let masters = config
            .masters
            .iter()
            .map(|name| Master {
                name: name.clone(),
                addr: None,
            })
            .collect();

        let mut context = Self {
            clients: ClientManager::new(config.max_clients),
            challenges: ChallengeCache::new(config.max_challenges),
            info_receipts: InfoReceipts::new(config.max_info_receipts),
            time: 0,
            time_residual: 0,
            map: String::new(),
            server_id: 0,
            restarted_server_id: 0,
            checksum_feed: 0,
            checksum_feed_server_id: 0,
            config_strings: BTreeMap::new(),
            game: collaborators.game,
            content: collaborators.content,
            store: collaborators.store,
            rng: StdRng::seed_from_u64(seed),
            bans: Vec::new(),
            masters,
            authorize_addr: None,
            rcon_last_time: None,
            rcon_log_time: None,
            next_heartbeat: None,
            outbox: Vec::new(),
            in_frame: false,
            config,
        };
        let map = context.config.map.clone();
        context.spawn_server(&map);
        context
    }

    /// Creates a server backed by the directories named in the config
    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let content: Box<dyn ContentStore> = match &config.content_dir {
            Some(dir) => Box::new(DirectoryContent::scan(dir, config.official_prefixes.clone())?),
            None => Box::new(MemoryContent::new()),
        };
        let collaborators = Collaborators {
            game: Box::new(ArenaGame::new()),
            content,
            store: Box::new(FileStore::new(config.data_dir.clone())),
        };
        Ok(Self::new(config, collaborators, rand::random()))
    }

    /// Drains the datagrams produced since the last call
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn config_string(&self, index: u16) -> &str {
        self.config_strings
            .get(&index)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn game(&self) -> &dyn GameRules {
        self.game.as_ref()
    }

    pub fn store(&self) -> &dyn PlayerStore {
        self.store.as_ref()
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans.contains(&ip)
    }

    /// Starts a new game epoch on `map`
    ///
    /// Connected clients are asked to connect again and fall back to
    /// `Connected`, so their next packet triggers a fresh gamestate.
    pub fn spawn_server(&mut self, map: &str) {
        info!("Spawning server on map {}", map);
        self.map = map.to_string();
        self.server_id = self.rng.gen_range(1..0x4000_0000);
        self.restarted_server_id = self.server_id;
        self.checksum_feed = self.rng.gen();
        self.checksum_feed_server_id = self.server_id;

        self.config_strings.clear();
        let server_info = self.server_info().to_string();
        let system_info = self.system_info().to_string();
        self.config_strings.insert(CS_SERVERINFO, server_info);
        self.config_strings.insert(CS_SYSTEMINFO, system_info);

        for index in 0..self.clients.capacity() {
            let Some(slot) = self.clients.get_mut(index) else {
                continue;
            };
            if slot.state < ClientState::Connected {
                continue;
            }
            let is_bot = slot.is_bot();
            let mut userinfo = slot.userinfo.clone();
            match self.game.client_connect(index, &mut userinfo, false, is_bot) {
                Err(reason) => self.drop_client(index, &reason),
                Ok(()) => {
                    if let Some(slot) = self.clients.get_mut(index) {
                        slot.userinfo = userinfo;
                        slot.state = ClientState::Connected;
                        slot.gamestate_message_num = None;
                    }
                    if is_bot {
                        self.bot_enter_world(index);
                    }
                }
            }
        }
    }

    /// Restarts the current map without disconnecting anyone
    ///
    /// The epoch changes, but packets still carrying the previous identifier
    /// are ignored instead of triggering a gamestate resend.
    pub fn map_restart(&mut self) {
        info!("Restarting map {}", self.map);
        self.restarted_server_id = self.server_id;
        self.server_id = self
            .server_id
            .saturating_add(self.rng.gen_range(1..=1000));
        let system_info = self.system_info().to_string();
        self.set_config_string(CS_SYSTEMINFO, &system_info);

        for _ in 0..3 {
            self.game.run_frame(self.time);
            self.time += RESTART_FRAME_MSEC;
        }

        for index in 0..self.clients.capacity() {
            let Some(slot) = self.clients.get(index) else {
                continue;
            };
            if slot.state < ClientState::Connected {
                continue;
            }
            let state = slot.state;
            let is_bot = slot.is_bot();
            let last_usercmd = slot.last_usercmd;
            let mut userinfo = slot.userinfo.clone();

            self.add_reliable(index, "map_restart\n");
            if let Err(reason) = self.game.client_connect(index, &mut userinfo, false, is_bot) {
                self.drop_client(index, &reason);
                continue;
            }
            match state {
                ClientState::Active => self.client_enter_world(index, last_usercmd),
                ClientState::Primed => self.client_enter_world(index, Default::default()),
                _ => {}
            }
        }

        self.game.run_frame(self.time);
        self.time += RESTART_FRAME_MSEC;
    }

    /// Drops every client and tells the directory servers
    pub fn shutdown(&mut self, reason: &str) {
        info!("Server shutdown: {}", reason);
        for index in 0..self.clients.capacity() {
            if self
                .clients
                .get(index)
                .is_some_and(|s| s.state >= ClientState::Connected)
            {
                self.drop_client(index, reason);
            }
        }

        for index in 0..self.clients.capacity() {
            if self
                .clients
                .get(index)
                .is_some_and(|s| s.state == ClientState::Zombie && !s.is_bot())
            {
                self.send_client_message(index);
            }
        }

        if self.config.public {
            self.send_heartbeats();
            self.send_heartbeats();
        }
    }

    /// Advances the server by `msec` of real time
    ///
    /// Runs whole simulation frames, then timeouts, outgoing messages and
    /// heartbeats. Calling it while a frame is already running does nothing.
    pub fn frame(&mut self, msec: u64) {
        if self.in_frame {
            warn!("Frame entered while already running");
            return;
        }
        self.in_frame = true;

        if self.time > TIME_WRAP_MSEC {
            let map = self.map.clone();
            self.shutdown("Restarting server due to time wrapping");
            self.time = 0;
            self.time_residual = 0;
            self.spawn_server(&map);
        }

        self.time_residual += msec;
        self.clients.calc_pings();

        let frame_msec = self.config.frame_msec();
        while self.time_residual >= frame_msec {
            self.time_residual -= frame_msec;
            self.time += frame_msec;
            self.game.run_frame(self.time);
        }

        self.apply_delayed_userinfo();
        self.check_timeouts();
        self.send_client_messages();
        self.master_heartbeat();

        self.in_frame = false;
    }

    /// Routes one inbound datagram
    pub fn packet_event(&mut self, from: NetAddr, data: &[u8]) {
        if is_connectionless(data) {
            self.connectionless_packet(from, data);
            return;
        }

        let (sequence, qport) = match read_client_header(data) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropped packet from {}: {}", from, e);
                return;
            }
        };

        let Some(index) = self.clients.find_by_channel(&from, qport) else {
            debug!("Sequenced packet from unknown address {}", from);
            self.send_oob(from, "disconnect");
            return;
        };

        let now = self.time;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        if slot.addr.port() != from.port() {
            info!("Translating port of client {} to {}", index, from);
            slot.addr = from;
        }
        if !slot.netchan.process(sequence) {
            return;
        }
        slot.last_packet_time = now;
        if slot.state == ClientState::Zombie {
            return;
        }

        match decode_client_body(data) {
            Ok(message) => self.execute_client_message(index, message),
            Err(e) => debug!("Ignoring undecodable packet from client {}: {}", index, e),
        }
    }

    pub(crate) fn send_oob(&mut self, to: NetAddr, text: &str) {
        if to.kind == shared::AddrKind::Bot {
            return;
        }
        self.outbox.push(Outgoing {
            to,
            data: encode_oob(text),
        });
    }

    pub(crate) fn server_info(&self) -> InfoString {
        let mut info = InfoString::new();
        let pairs = [
            ("sv_hostname", self.config.hostname.clone()),
            ("mapname", self.map.clone()),
            ("gametype", self.config.gametype.to_string()),
            ("sv_maxclients", self.config.public_clients().to_string()),
            ("protocol", PROTOCOL_VERSION.to_string()),
            ("sv_allowDownload", (self.config.allow_download as i32).to_string()),
            ("sv_floodProtect", (self.config.flood_protect as i32).to_string()),
            ("sv_minPing", nonzero(self.config.min_ping)),
            ("sv_maxPing", nonzero(self.config.max_ping)),
        ];
        for (key, value) in pairs {
            if let Err(e) = info.set(key, &value) {
                warn!("Server info {} not set: {}", key, e);
            }
        }
        info
    }

    /// System info carries the epoch and what clients must load to play
    pub(crate) fn system_info(&self) -> InfoString {
        let mut info = InfoString::new();
        let join = |values: Vec<String>| values.join(" ");

        let mut pairs = vec![
            ("sv_serverid", self.server_id.to_string()),
            ("sv_pure", (self.config.pure as i32).to_string()),
        ];
        if self.config.pure {
            if let Some(sums) = self.content.pure_checksums() {
                let mut paks = vec![sums.cgame, sums.ui];
                for checksum in sums.loaded {
                    if !paks.contains(&checksum) {
                        paks.push(checksum);
                    }
                }
                pairs.push(("sv_paks", join(paks.iter().map(i32::to_string).collect())));
            }
        }
        pairs.push((
            "sv_referencedPaks",
            join(
                self.content
                    .archive_checksums()
                    .iter()
                    .map(i32::to_string)
                    .collect(),
            ),
        ));
        pairs.push((
            "sv_referencedPakNames",
            join(self.content.referenced_archives()),
        ));

        for (key, value) in pairs {
            if let Err(e) = info.set(key, &value) {
                warn!("System info {} not set: {}", key, e);
            }
        }
        info
    }

    /// Changes a configuration string and propagates it
    ///
    /// Active clients get a `cs` command now; primed clients get it when they
    /// enter the world.
    pub fn set_config_string(&mut self, index: u16, value: &str) {
        if self.config_string(index) == value {
            return;
        }
        self.config_strings.insert(index, value.to_string());

        let command = format!("cs {} {}\n", index, quote(value));
        for client in 0..self.clients.capacity() {
            let Some(slot) = self.clients.get_mut(client) else {
                continue;
            };
            match slot.state {
                ClientState::Active => {
                    self.add_reliable(client, &command);
                }
                ClientState::Primed => {
                    slot.cs_updated.insert(index);
                }
                _ => {}
            }
        }
    }

    /// Sends a reliable command to one client, or to every client when
    /// `target` is `None`
    ///
    /// Text that could not fit in a message is discarded.
    pub fn send_server_command(&mut self, target: Option<usize>, text: &str) {
        if text.len() > MAX_STRING_CHARS - 2 {
            warn!("Server command too long, ignored: {:.64}", text);
            return;
        }

        match target {
            Some(index) => {
                self.add_reliable(index, text);
            }
            None => {
                if text.starts_with("print") {
                    info!("broadcast: {}", text.trim_end());
                }
                for index in 0..self.clients.capacity() {
                    if self
                        .clients
                        .get(index)
                        .is_some_and(|s| s.state >= ClientState::Primed)
                    {
                        self.add_reliable(index, text);
                    }
                }
            }
        }
    }

    /// Queues a reliable command; returns false when the client had to be
    /// dropped because its ring overflowed
    pub(crate) fn add_reliable(&mut self, index: usize, text: &str) -> bool {
        let Some(slot) = self.clients.get_mut(index) else {
            return false;
        };
        if slot.state < ClientState::Primed {
            return true;
        }
        match slot.reliable.push(text) {
            Ok(_) => true,
            Err(e) => {
                warn!("Client {}: {}", index, e);
                self.drop_slot(index, SlotError::ReliableOverflow);
                false
            }
        }
    }

    pub(crate) fn drop_slot(&mut self, index: usize, error: SlotError) {
        debug!("Dropping client {}: {:?}", index, error);
        self.drop_client(index, &error.drop_reason());
    }

    /// Ends a connection
    ///
    /// Everyone is told why, the game forgets the player and the slot turns
    /// into a zombie that keeps retransmitting the final `disconnect`. Bots are
    /// freed at once.
    pub fn drop_client(&mut self, index: usize, reason: &str) {
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        if slot.state <= ClientState::Zombie {
            return;
        }

        let previous = slot.state;
        slot.state = ClientState::Zombie;
        slot.last_packet_time = self.time;
        let addr = slot.addr;
        let name = slot.name.clone();
        let is_bot = slot.is_bot();
        let guid = slot.userinfo.value("cl_guid").to_string();
        slot.download = None;
        slot.download_refusal = None;
        slot.pending_userinfo = None;
        let demo = slot.demo.take();

        if !is_bot {
            self.challenges.mark_disconnected(&addr);
        }
        if let Some(demo) = demo {
            if let Err(e) = demo.stop() {
                warn!("Could not finish demo of client {}: {}", index, e);
            }
        }

        info!("Client {} ({}) dropped: {}", index, name, reason);
        self.send_server_command(None, &format!("print {}", quote(&format!("{} {}\n", name, reason))));

        if self.config.persistent_positions && shared::is_valid_guid(&guid) {
            if let Some(position) = self.game.position(index).filter(|p| !p.is_zero()) {
                if let Err(e) = self.store.save(&self.map, &guid, &position) {
                    warn!("Could not save position of client {}: {}", index, e);
                }
            }
        }
        self.game.client_disconnect(index);

        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        if previous >= ClientState::Primed {
            let command = format!("disconnect {}", quote(reason));
            if slot.reliable.push(&command).is_err() {
                slot.reliable.force_push(&command);
            }
        }
        slot.userinfo = InfoString::new();

        if is_bot {
            self.clients.replace(index, crate::client_manager::ClientSlot::free());
        }

        if self.clients.count_at_least(ClientState::Connected) == 0 {
            self.force_heartbeat();
        }
    }

    fn apply_delayed_userinfo(&mut self) {
        if !self.config.flood_protect {
            return;
        }
        let now = self.time;
        for index in 0..self.clients.capacity() {
            let pending = match self.clients.get_mut(index) {
                Some(slot)
                    if slot.state >= ClientState::Active
                        && now >= slot.next_userinfo_time
                        && slot.pending_userinfo.is_some() =>
                {
                    slot.pending_userinfo.take()
                }
                _ => None,
            };
            if let Some(raw) = pending {
                self.update_userinfo(index, &raw);
            }
        }
    }

    fn check_timeouts(&mut self) {
        let timed_out = self.clients.check_timeouts(
            self.time,
            self.config.timeout * 1000,
            self.config.zombie_time * 1000,
        );
        for index in timed_out {
            self.drop_client(index, "timed out");
        }
    }

    /// Sends the next message to every client that is due one
    fn send_client_messages(&mut self) {
        let now = self.time;
        for index in 0..self.clients.capacity() {
            let Some(slot) = self.clients.get_mut(index) else {
                continue;
            };
            if slot.is_free() || slot.is_bot() || slot.state == ClientState::Connected {
                continue;
            }
            if now < slot.next_snapshot_time {
                continue;
            }
            slot.next_snapshot_time = now + slot.snapshot_msec;
            self.send_client_message(index);
        }
    }

    /// Encodes and queues a sequenced message for one client
    pub(crate) fn transmit(&mut self, index: usize, message: &ServerMessage) {
        let now = self.time;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        let sequence = slot.netchan.next_outgoing();
        let data = match encode_server_packet(sequence, message) {
            Ok(data) => data,
            Err(e) => {
                error!("Could not encode message for client {}: {}", index, e);
                return;
            }
        };
        if data.len() > MAX_MSGLEN {
            warn!(
                "Message to client {} is {} bytes, over the {} limit",
                index,
                data.len(),
                MAX_MSGLEN
            );
        }

        slot.record_sent(sequence, now);
        if let Some(demo) = slot.demo.as_mut() {
            if let Err(e) = demo.write_message(sequence, &data) {
                warn!("Demo of client {} failed: {}", index, e);
                slot.demo = None;
            }
        }
        if !slot.is_bot() {
            self.outbox.push(Outgoing {
                to: slot.addr,
                data,
            });
        }
    }

    /// Sends a heartbeat on the next frame
    pub fn force_heartbeat(&mut self) {
        self.next_heartbeat = None;
    }

    fn master_heartbeat(&mut self) {
        if !self.config.public || self.masters.is_empty() {
            return;
        }
        if self.next_heartbeat.is_some_and(|next| self.time < next) {
            return;
        }
        self.next_heartbeat = Some(self.time + HEARTBEAT_MSEC);
        self.send_heartbeats();
    }

    fn send_heartbeats(&mut self) {
        let text = format!("heartbeat {}\n", self.config.heartbeat_game);
        let mut targets = Vec::new();
        for master in &mut self.masters {
            if master.name.is_empty() {
                continue;
            }
            if master.addr.is_none() {
                match resolve_host(&master.name, PORT_MASTER) {
                    Ok(addr) => {
                        info!("Master {} resolved to {}", master.name, addr);
                        master.addr = Some(addr);
                    }
                    Err(e) => {
                        warn!("{}, master removed", e);
                        master.name.clear();
                        continue;
                    }
                }
            }
            if let Some(addr) = master.addr {
                targets.push(addr);
            }
        }
        for addr in targets {
            debug!("Sending heartbeat to {}", addr);
            self.send_oob(NetAddr::remote(addr), &text);
        }
    }
}

fn nonzero(value: u64) -> String {
    if value == 0 {
        String::new()
    } else {
        value.to_string()
    }
}

/// Resolves `host` or `host:port`
pub fn resolve_host(name: &str, default_port: u16) -> Result<SocketAddr, ServerError> {
    let target = if name.contains(':') {
        name.to_string()
    } else {
        format!("{}:{}", name, default_port)
    };
    target
        .to_socket_addrs()
        .map_err(|_| ServerError::Resolve(name.to_string()))?
        .next()
        .ok_or_else(|| ServerError::Resolve(name.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use shared::packet::{
        decode_oob, decode_server_packet, encode_client_packet, ClientMessage, UserMove,
    };
    use shared::UserCmd;

    pub const GUID: &str = "0123456789ABCDEF0123456789ABCDEF";

    pub fn context() -> ServerContext {
        context_with(ServerConfig::default())
    }

    pub fn context_with(config: ServerConfig) -> ServerContext {
        ServerContext::new(config, Collaborators::in_memory(), 1)
    }

    pub fn remote(s: &str) -> NetAddr {
        NetAddr::remote(s.parse().unwrap())
    }

    /// Connectionless replies sent to `to`
    pub fn oob_replies(outgoing: &[Outgoing], to: NetAddr) -> Vec<String> {
        outgoing
            .iter()
            .filter(|o| o.to == to)
            .filter_map(|o| decode_oob(&o.data))
            .collect()
    }

    /// Sequenced messages sent to `to`
    pub fn messages(outgoing: &[Outgoing], to: NetAddr) -> Vec<(i32, ServerMessage)> {
        outgoing
            .iter()
            .filter(|o| o.to == to && !is_connectionless(&o.data))
            .filter_map(|o| decode_server_packet(&o.data).ok())
            .collect()
    }

    pub fn challenge(ctx: &mut ServerContext, from: NetAddr) -> i32 {
        ctx.packet_event(from, &encode_oob("getchallenge"));
        let replies = oob_replies(&ctx.take_outgoing(), from);
        replies
            .iter()
            .find_map(|r| r.strip_prefix("challengeResponse "))
            .and_then(|t| t.trim().parse().ok())
            .unwrap()
    }

    pub fn connect_line(challenge: i32, qport: u16, name: &str) -> String {
        format!(
            "connect \"\\protocol\\{}\\qport\\{}\\challenge\\{}\\name\\{}\\cl_guid\\{}\"",
            PROTOCOL_VERSION, qport, challenge, name, GUID
        )
    }

    /// Runs the challenge handshake and connect, returning the slot
    pub fn connect(ctx: &mut ServerContext, from: NetAddr, qport: u16, name: &str) -> usize {
        let token = challenge(ctx, from);
        ctx.packet_event(from, &encode_oob(&connect_line(token, qport, name)));
        let replies = oob_replies(&ctx.take_outgoing(), from);
        assert!(replies.iter().any(|r| r == "connectResponse"), "{:?}", replies);
        ctx.clients.find_by_channel(&from, qport).unwrap()
    }

    pub fn send(
        ctx: &mut ServerContext,
        from: NetAddr,
        sequence: i32,
        qport: u16,
        message: &ClientMessage,
    ) {
        let data = encode_client_packet(sequence, qport, message).unwrap();
        ctx.packet_event(from, &data);
    }

    pub fn message(server_id: i32, message_acknowledge: i32, reliable_acknowledge: i32) -> ClientMessage {
        ClientMessage {
            server_id,
            message_acknowledge,
            reliable_acknowledge,
            commands: Vec::new(),
            movement: None,
        }
    }

    pub fn movement(server_time: u64) -> Option<UserMove> {
        Some(UserMove {
            delta: false,
            cmds: vec![UserCmd {
                server_time,
                ..UserCmd::default()
            }],
        })
    }

    /// Connects a client and takes it all the way to `Active`
    pub fn activate(ctx: &mut ServerContext, from: NetAddr, qport: u16, name: &str) -> usize {
        let index = connect(ctx, from, qport, name);
        send(ctx, from, 1, qport, &message(0, 0, 0));
        let gamestate = ctx.clients.get(index).unwrap().gamestate_message_num.unwrap();
        ctx.take_outgoing();

        let mut msg = message(ctx.server_id, gamestate, 0);
        msg.movement = movement(ctx.time + 1);
        send(ctx, from, 2, qport, &msg);
        assert_eq!(ctx.clients.get(index).unwrap().state, ClientState::Active);
        index
    }
}
