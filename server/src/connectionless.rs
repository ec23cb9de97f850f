//! Connectionless request handling and admission
//!
//! Out-of-band datagrams carry a single text command. Admission (`connect`)
//! runs its checks in a fixed order and commits a slot only after every check
//! and the game rules have accepted the client.

use crate::client_manager::{ClientSlot, ClientState};
use crate::context::{resolve_host, ServerContext};
use crate::error::AdmissionError;
use log::{debug, info, warn};
use shared::command::{args_from, quote, tokenize};
use shared::packet::{command_line, decode_oob};
use shared::{is_valid_guid, AddrKind, InfoString, NetAddr, PROTOCOL_VERSION};
use std::net::{IpAddr, SocketAddr};

/// Default port of the authorization server
pub const PORT_AUTHORIZE: u16 = 27952;

/// Longest challenge echo an info or status query may carry
pub const MAX_CHALLENGE_ECHO: usize = 128;

/// Minimum time between two rcon attempts with a wrong password
pub const RCON_BAD_INTERVAL_MSEC: u64 = 600;

/// Minimum time between two rcon commands with the right password
pub const RCON_GOOD_INTERVAL_MSEC: u64 = 180;

/// Largest piece of rcon output sent in one datagram
pub const RCON_CHUNK: usize = 1008;

const LOG_INTERVAL_MSEC: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionlessCommand {
    GetStatus,
    GetInfo,
    GetChallenge,
    Connect,
    IpAuthorize,
    Rcon,
    Disconnect,
}

impl ConnectionlessCommand {
    fn lookup(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let command = match name.as_str() {
            "getstatus" => Self::GetStatus,
            "getinfo" => Self::GetInfo,
            "getchallenge" => Self::GetChallenge,
            "connect" => Self::Connect,
            "ipauthorize" => Self::IpAuthorize,
            "rcon" => Self::Rcon,
            "disconnect" => Self::Disconnect,
            _ => return None,
        };
        Some(command)
    }
}

impl ServerContext {
    pub(crate) fn connectionless_packet(&mut self, from: NetAddr, data: &[u8]) {
        let Some(text) = decode_oob(data) else {
            return;
        };
        let line = command_line(&text);
        let args = tokenize(line);
        let Some(name) = args.first() else {
            return;
        };
        debug!("Connectionless packet from {}: {}", from, name);

        match ConnectionlessCommand::lookup(name) {
            Some(ConnectionlessCommand::GetStatus) => self.status_request(from, &args),
            Some(ConnectionlessCommand::GetInfo) => self.info_request(from, &args),
            Some(ConnectionlessCommand::GetChallenge) => self.challenge_request(from),
            Some(ConnectionlessCommand::Connect) => {
                let userinfo = args.get(1).map(String::as_str).unwrap_or("");
                match self.direct_connect(from, userinfo) {
                    Ok(index) => debug!("{} admitted to slot {}", from, index),
                    Err(e) => {
                        info!("Rejected connect from {}: {}", from, e);
                        if let Some(reply) = e.reply() {
                            self.send_oob(from, &reply);
                        }
                    }
                }
            }
            Some(ConnectionlessCommand::IpAuthorize) => self.authorize_verdict(from, &args),
            Some(ConnectionlessCommand::Rcon) => self.remote_command(from, line, &args),
            // Old clients send this after the server closed their channel
            Some(ConnectionlessCommand::Disconnect) => {}
            None => debug!("Bad connectionless packet from {}: {:.32}", from, line),
        }
    }

    fn challenge_request(&mut self, from: NetAddr) {
        let token = self.challenges.issue(from, self.time, &mut self.rng);
        self.send_oob(from, &format!("challengeResponse {}", token));

        if from.is_lan() {
            return;
        }
        if let Some(authorize) = self.authorize_addr() {
            let request = format!(
                "getIpAuthorize {} {} {} 0 0",
                token,
                from.ip(),
                self.config.heartbeat_game
            );
            self.send_oob(NetAddr::remote(authorize), &request);
        }
    }

    /// Address of the authorization server, resolved on first use
    fn authorize_addr(&mut self) -> Option<SocketAddr> {
        if self.authorize_addr.is_none() {
            let name = self.config.authorize_server.clone()?;
            match resolve_host(&name, PORT_AUTHORIZE) {
                Ok(addr) => {
                    info!("Authorize server {} resolved to {}", name, addr);
                    self.authorize_addr = Some(addr);
                }
                Err(e) => {
                    warn!("{}", e);
                    self.config.authorize_server = None;
                }
            }
        }
        self.authorize_addr
    }

    /// `ipauthorize <challenge> <verdict> [reason]` from the authorize server
    fn authorize_verdict(&mut self, from: NetAddr, args: &[String]) {
        let Some(authorize) = self.authorize_addr() else {
            return;
        };
        if from.kind != AddrKind::Remote || from.ip() != authorize.ip() {
            debug!("ipAuthorize from {} ignored", from);
            return;
        }
        let Some(token) = args.get(1).and_then(|t| t.parse::<i32>().ok()) else {
            return;
        };
        let verdict = args.get(2).map(String::as_str).unwrap_or("");
        let reason = args.get(3).map(String::as_str);

        match self.challenges.authorize(token, verdict, reason) {
            Some(reply) => self.send_oob(reply.to, &reply.text),
            None => debug!("ipAuthorize for unknown challenge {}", token),
        }
    }

    /// Shared gate for info and status queries
    fn answerable_query<'a>(&mut self, from: NetAddr, args: &'a [String]) -> Option<&'a str> {
        if self.info_receipts.should_block(&from, self.time) {
            return None;
        }
        let challenge = args.get(1).map(String::as_str).unwrap_or("");
        if challenge.len() > MAX_CHALLENGE_ECHO {
            return None;
        }
        Some(challenge)
    }

    fn info_request(&mut self, from: NetAddr, args: &[String]) {
        let Some(challenge) = self.answerable_query(from, args) else {
            return;
        };

        let private = self.config.private_clients;
        let public_clients = self
            .clients
            .iter()
            .filter(|(index, slot)| *index >= private && slot.state >= ClientState::Connected)
            .count();

        let mut info = InfoString::new();
        let pairs = [
            ("challenge", challenge.to_string()),
            ("protocol", PROTOCOL_VERSION.to_string()),
            ("hostname", self.config.hostname.clone()),
            ("mapname", self.map.clone()),
            ("clients", public_clients.to_string()),
            ("bots", self.clients.bots().to_string()),
            ("g_humanplayers", self.clients.humans().to_string()),
            ("sv_maxclients", self.config.public_clients().to_string()),
            ("gametype", self.config.gametype.to_string()),
            ("pure", (self.config.pure as i32).to_string()),
            ("minPing", positive(self.config.min_ping)),
            ("maxPing", positive(self.config.max_ping)),
        ];
        for (key, value) in pairs {
            if let Err(e) = info.set(key, &value) {
                debug!("infoResponse {} dropped: {}", key, e);
            }
        }
        self.send_oob(from, &format!("infoResponse\n{}", info));
    }

    fn status_request(&mut self, from: NetAddr, args: &[String]) {
        let Some(challenge) = self.answerable_query(from, args) else {
            return;
        };

        let mut info = self.server_info();
        if let Err(e) = info.set("challenge", challenge) {
            debug!("statusResponse challenge dropped: {}", e);
        }
        let mut text = format!("statusResponse\n{}\n", info);
        for (index, slot) in self.clients.iter() {
            if slot.state >= ClientState::Connected {
                text.push_str(&format!(
                    "{} {} {}\n",
                    self.game.score(index),
                    slot.ping,
                    quote(&slot.name)
                ));
            }
        }
        self.send_oob(from, &text);
    }

    /// Admits a client
    ///
    /// Checks run in order: protocol, reconnect cooldown, ban, challenge,
    /// ping bounds, per-IP cap, GUID, then slot allocation and the game rules.
    /// Nothing is committed until every check passed.
    pub fn direct_connect(&mut self, from: NetAddr, raw_userinfo: &str) -> Result<usize, AdmissionError> {
        let now = self.time;
        let mut userinfo = InfoString::parse(raw_userinfo);

        let protocol = userinfo.value("protocol").parse::<i32>().unwrap_or(0);
        if protocol != PROTOCOL_VERSION {
            return Err(AdmissionError::ProtocolMismatch(PROTOCOL_VERSION));
        }
        let qport = userinfo.value("qport").parse::<u16>().unwrap_or(0);
        let challenge = userinfo.value("challenge").parse::<i32>().unwrap_or(0);

        let reconnect = self.clients.find_reconnect(&from, qport);
        if let Some(slot) = reconnect.and_then(|index| self.clients.get(index)) {
            if now.saturating_sub(slot.last_connect_time) < self.config.reconnect_limit * 1000 {
                debug!("{}: reconnect rejected, too soon", from);
                return Err(AdmissionError::ReconnectTooSoon);
            }
        }

        if from.kind == AddrKind::Remote && self.is_banned(from.ip()) {
            return Err(AdmissionError::Banned);
        }

        if !from.is_local() {
            let ping = self
                .challenges
                .validate(&from, challenge, now)
                .ok_or(AdmissionError::BadChallenge)?;

            if !from.is_lan() {
                if self.config.min_ping > 0 && ping < self.config.min_ping {
                    return Err(AdmissionError::PingTooLow);
                }
                if self.config.max_ping > 0 && ping > self.config.max_ping {
                    return Err(AdmissionError::PingTooHigh);
                }
                if self.config.clients_per_ip > 0
                    && self.clients.count_from_host(&from, reconnect) >= self.config.clients_per_ip
                {
                    return Err(AdmissionError::TooManyFromIp);
                }
                if self.config.check_client_guid && !is_valid_guid(userinfo.value("cl_guid")) {
                    return Err(AdmissionError::InvalidGuid);
                }
            }
        }

        let ip = if from.is_local() {
            "localhost".to_string()
        } else {
            from.to_string()
        };
        userinfo
            .set("ip", &ip)
            .map_err(|_| AdmissionError::UserinfoTooLong)?;

        let index = match reconnect {
            Some(index) => {
                info!("{}: reconnect", from);
                self.release_for_reconnect(index);
                index
            }
            None => self.allocate_slot(from, &userinfo)?,
        };

        if let Err(reason) = self.game.client_connect(index, &mut userinfo, true, false) {
            info!("Game rejected {}: {}", from, reason);
            if reconnect.is_some() {
                self.clients.replace(index, ClientSlot::free());
            }
            return Err(AdmissionError::GameRejected(reason));
        }

        let mut slot = ClientSlot::connected(from, qport, challenge, now);
        slot.userinfo = userinfo;
        self.clients.replace(index, slot);
        info!("Client {} connecting from {}", index, from);

        if !self.userinfo_changed(index) {
            return Ok(index);
        }
        self.send_oob(from, "connectResponse");

        if self.config.persistent_positions {
            self.load_position(index);
        }

        let connected = self.clients.count_at_least(ClientState::Connected);
        if connected == 1 || connected == self.clients.capacity() {
            self.force_heartbeat();
        }
        Ok(index)
    }

    /// Lets the game forget the previous connection of a reconnecting client
    fn release_for_reconnect(&mut self, index: usize) {
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        let live = slot.state >= ClientState::Connected;
        if let Some(demo) = slot.demo.take() {
            if let Err(e) = demo.stop() {
                warn!("Could not finish demo of client {}: {}", index, e);
            }
        }
        if live {
            self.game.client_disconnect(index);
        }
    }

    /// Picks a free slot, honouring reserved slots
    ///
    /// A local client on a full server takes over the last slot.
    fn allocate_slot(&mut self, from: NetAddr, userinfo: &InfoString) -> Result<usize, AdmissionError> {
        let password = userinfo.value("password");
        let private = !self.config.private_password.is_empty()
            && password == self.config.private_password;
        let start = if private {
            0
        } else {
            self.config.private_clients
        };

        if let Some(index) = self.clients.first_free(start) {
            return Ok(index);
        }
        if from.is_local() && self.clients.capacity() > 0 {
            let last = self.clients.capacity() - 1;
            self.drop_client(last, "was kicked to make room");
            self.clients.replace(last, ClientSlot::free());
            return Ok(last);
        }
        Err(AdmissionError::ServerFull)
    }

    /// Puts a bot straight into the world
    pub fn add_bot(&mut self, name: &str) -> Result<usize, AdmissionError> {
        let mut userinfo = InfoString::new();
        userinfo
            .set("name", name)
            .map_err(|_| AdmissionError::UserinfoTooLong)?;

        let index = self
            .clients
            .first_free(self.config.private_clients)
            .ok_or(AdmissionError::ServerFull)?;
        self.game
            .client_connect(index, &mut userinfo, true, true)
            .map_err(AdmissionError::GameRejected)?;

        let mut slot = ClientSlot::connected(NetAddr::bot(), 0, 0, self.time);
        slot.userinfo = userinfo;
        self.clients.replace(index, slot);
        if self.userinfo_changed(index) {
            self.bot_enter_world(index);
        }
        info!("Bot {} added to slot {}", name, index);
        Ok(index)
    }

    fn rcon_exempt(&self, from: &NetAddr) -> bool {
        if from.is_local() {
            return true;
        }
        self.config
            .rcon_allowed_ip
            .as_deref()
            .and_then(|host| host.parse::<IpAddr>().ok())
            .is_some_and(|ip| ip == from.ip())
    }

    /// `rcon <password> <command...>`
    fn remote_command(&mut self, from: NetAddr, line: &str, args: &[String]) {
        let now = self.time;
        let password = &self.config.rcon_password;
        let good = !password.is_empty() && args.get(1).is_some_and(|p| p == password);

        if !self.rcon_exempt(&from) {
            let interval = if good {
                RCON_GOOD_INTERVAL_MSEC
            } else {
                RCON_BAD_INTERVAL_MSEC
            };
            if self
                .rcon_last_time
                .is_some_and(|last| now.saturating_sub(last) < interval)
            {
                if log_due(&mut self.rcon_log_time, now) {
                    warn!("Rcon from {} throttled", from);
                }
                return;
            }
            self.rcon_last_time = Some(now);
        }

        let output = if self.config.rcon_password.is_empty() {
            "No rconpassword set on the server.\n".to_string()
        } else if !good {
            if log_due(&mut self.rcon_log_time, now) {
                warn!("Bad rcon from {}", from);
            }
            "Bad rconpassword.\n".to_string()
        } else {
            let command = args_from(line, 2);
            info!("Rcon from {}: {}", from, command);
            self.execute_operator_command(command)
        };

        for chunk in chunks(&output, RCON_CHUNK) {
            self.send_oob(from, &format!("print\n{}", chunk));
        }
    }
}

fn positive(value: u64) -> String {
    if value == 0 {
        String::new()
    } else {
        value.to_string()
    }
}

fn log_due(last: &mut Option<u64>, now: u64) -> bool {
    if last.is_some_and(|t| now.saturating_sub(t) < LOG_INTERVAL_MSEC) {
        return false;
    }
    *last = Some(now);
    true
}

/// Splits text into pieces of at most `max` bytes on character boundaries
fn chunks(text: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (piece, tail) = rest.split_at(end);
        pieces.push(piece);
        rest = tail;
    }
    pieces
}
