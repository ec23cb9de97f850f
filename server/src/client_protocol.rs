//! Per-client protocol state machine
//!
//! Everything that happens to a slot after admission: executing sequenced
//! client messages, the gamestate handshake, entering the world, reliable
//! client commands, downloads and the messages sent back every snapshot.

use crate::client_manager::ClientState;
use crate::context::ServerContext;
use crate::demo::{demo_file_name, DemoRecorder};
use crate::download::{blocks_per_snapshot, open_download, BlockAck};
use crate::error::SlotError;
use crate::game::GameEvent;
use crate::pure_check::{verify_report, PureVerdict};
use log::{debug, info, warn};
use shared::command::{quote, tokenize};
use shared::packet::{
    encode_server_packet, ClientMessage, Gamestate, ReliableCommand, ServerMessage, ServerOp,
    Snapshot, UserMove,
};
use shared::{InfoString, UserCmd, MAX_PACKET_USERCMDS, MAX_STRING_CHARS};
use std::io;
use std::path::PathBuf;

/// Minimum time between two applied userinfo changes under flood protection
pub const USERINFO_DELAY_MSEC: u64 = 5000;

/// Rate given to LAN clients when `lan_force_rate` is set
pub const LAN_RATE: u32 = 99999;

const DEFAULT_RATE: u32 = 3000;
const DEFAULT_SNAPSHOT_MSEC: u64 = 50;

/// Reliable commands the connection layer handles itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientCommand {
    Userinfo,
    Disconnect,
    PureReport,
    ResetPure,
    Download,
    NextDownload,
    StopDownload,
    DoneDownload,
    SavePosition,
    LoadPosition,
}

impl ClientCommand {
    /// Resolves a command name, ignoring case
    fn lookup(name: &str, persistent_positions: bool) -> Option<Self> {
        let command = match name.to_ascii_lowercase().as_str() {
            "userinfo" => Self::Userinfo,
            "disconnect" => Self::Disconnect,
            "cp" => Self::PureReport,
            "vdr" => Self::ResetPure,
            "download" => Self::Download,
            "nextdl" => Self::NextDownload,
            "stopdl" => Self::StopDownload,
            "donedl" => Self::DoneDownload,
            "save" | "savepos" => Self::SavePosition,
            "load" | "loadpos" => Self::LoadPosition,
            _ => return None,
        };
        match command {
            Self::SavePosition | Self::LoadPosition if !persistent_positions => None,
            other => Some(other),
        }
    }
}

impl ServerContext {
    /// Applies one decoded client message to its slot
    pub(crate) fn execute_client_message(&mut self, index: usize, message: ClientMessage) {
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };

        if message.message_acknowledge < 0 {
            debug!("Client {} sent negative message acknowledge", index);
            self.drop_slot(index, SlotError::ProtocolViolation);
            return;
        }
        // Never past the last message sent, never backwards
        let last_sent = slot.netchan.outgoing_sequence() - 1;
        let acknowledge = message.message_acknowledge.min(last_sent);
        if acknowledge < slot.message_acknowledge {
            debug!(
                "Client {} acknowledged {} after {}, ignored",
                index, acknowledge, slot.message_acknowledge
            );
        } else {
            slot.message_acknowledge = acknowledge;
        }
        let acknowledge = slot.message_acknowledge;

        if let Err(e) = slot.reliable.set_acknowledge(message.reliable_acknowledge) {
            debug!("Client {}: {}", index, e);
            self.drop_slot(index, SlotError::ProtocolViolation);
            return;
        }

        // A client on an old epoch, or one that has not seen a gamestate yet,
        // only gets the gamestate back. Downloads continue across epochs.
        let resync = (message.server_id != self.server_id || slot.state == ClientState::Connected)
            && slot.download.is_none()
            && !slot.last_client_command_text.starts_with("nextdl");
        if resync {
            if message.server_id >= self.restarted_server_id && message.server_id < self.server_id {
                debug!("Client {} is still loading the restarted map", index);
                return;
            }
            let behind = slot
                .gamestate_message_num
                .map_or(true, |sent| acknowledge > sent);
            if behind {
                self.send_gamestate(index);
            }
            return;
        }

        if let Some(command) = message
            .commands
            .iter()
            .find(|c| c.text.len() > MAX_STRING_CHARS)
        {
            debug!(
                "Client {} sent a {} byte command",
                index,
                command.text.len()
            );
            self.drop_slot(index, SlotError::ProtocolViolation);
            return;
        }

        for command in message.commands {
            let Some(slot) = self.clients.get(index) else {
                return;
            };
            if command.sequence <= slot.last_client_command {
                continue;
            }
            if command.sequence > slot.last_client_command + 1 {
                info!(
                    "Client {} lost reliable commands ({} after {})",
                    index, command.sequence, slot.last_client_command
                );
                self.drop_slot(index, SlotError::LostCommands);
                return;
            }

            self.execute_client_command(index, &command);

            let Some(slot) = self.clients.get_mut(index) else {
                return;
            };
            slot.last_client_command = command.sequence;
            slot.last_client_command_text = command.text;
            if slot.state <= ClientState::Zombie {
                return;
            }
        }

        if let Some(movement) = message.movement {
            self.user_move(index, movement);
        }
    }

    fn execute_client_command(&mut self, index: usize, command: &ReliableCommand) {
        let args = tokenize(&command.text);
        let Some(name) = args.first() else {
            return;
        };

        let now = self.time;
        let burst = self.config.flood_burst;
        let flood_protect = self.config.flood_protect;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        let allowed = if flood_protect
            && slot.state == ClientState::Active
            && slot.download.is_none()
        {
            slot.flood.allow(now, burst)
        } else {
            true
        };
        if !allowed {
            debug!("Client {} flooding, ignored {}", index, name);
            return;
        }

        match ClientCommand::lookup(name, self.config.persistent_positions) {
            Some(ClientCommand::Userinfo) => {
                let raw = args.get(1).cloned().unwrap_or_default();
                self.userinfo_command(index, &raw);
            }
            Some(ClientCommand::Disconnect) => self.drop_client(index, "disconnected"),
            Some(ClientCommand::PureReport) => self.pure_report(index, &args),
            Some(ClientCommand::ResetPure) => {
                slot.got_pure_report = false;
                slot.pure_authentic = false;
            }
            Some(ClientCommand::Download) => {
                let file = args.get(1).cloned().unwrap_or_default();
                self.begin_download(index, &file);
            }
            Some(ClientCommand::NextDownload) => self.next_download(index, args.get(1)),
            Some(ClientCommand::StopDownload) => {
                if let Some(session) = slot.download.take() {
                    info!("Client {} stopped download of {}", index, session.name());
                }
            }
            Some(ClientCommand::DoneDownload) => {
                if slot.download_gamestate_sent {
                    slot.download_gamestate_sent = false;
                } else if slot.state != ClientState::Active {
                    self.send_gamestate(index);
                }
            }
            Some(ClientCommand::SavePosition) => self.save_position(index),
            Some(ClientCommand::LoadPosition) => self.load_position(index),
            None => {
                if slot.state >= ClientState::Primed {
                    let events = self.game.client_command(index, &args);
                    self.dispatch_game_events(events);
                }
            }
        }
    }

    pub(crate) fn dispatch_game_events(&mut self, events: Vec<GameEvent>) {
        for event in events {
            match event {
                GameEvent::Print { target, text } => {
                    self.send_server_command(target, &format!("print {}", quote(&text)));
                }
            }
        }
    }

    fn userinfo_command(&mut self, index: usize, raw: &str) {
        let now = self.time;
        let flood_protect = self.config.flood_protect;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };

        if flood_protect && slot.state >= ClientState::Active && now < slot.next_userinfo_time {
            slot.pending_userinfo = Some(raw.to_string());
            self.send_server_command(
                Some(index),
                "print \"Command delayed due to flood protection.\n\"",
            );
            return;
        }
        slot.pending_userinfo = None;
        self.update_userinfo(index, raw);
    }

    /// Replaces a client's userinfo and lets the game see the result
    pub(crate) fn update_userinfo(&mut self, index: usize, raw: &str) {
        let now = self.time;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        slot.userinfo = InfoString::parse(raw);
        slot.next_userinfo_time = now + USERINFO_DELAY_MSEC;

        if self.userinfo_changed(index) {
            if let Some(slot) = self.clients.get(index) {
                let userinfo = slot.userinfo.clone();
                self.game.client_userinfo_changed(index, &userinfo);
            }
        }
    }

    /// Derives name, rate and snapshot cadence from the userinfo
    ///
    /// Returns false if the client had to be dropped.
    pub(crate) fn userinfo_changed(&mut self, index: usize) -> bool {
        let now = self.time;
        let fps = self.config.fps.max(1);
        let lan_force_rate = self.config.lan_force_rate;
        let Some(slot) = self.clients.get_mut(index) else {
            return false;
        };

        slot.name = slot.userinfo.value("name").to_string();

        slot.rate = if lan_force_rate && slot.addr.is_lan() {
            LAN_RATE
        } else {
            match slot.userinfo.value("rate").parse::<u32>() {
                Ok(rate) => rate.clamp(1000, 90000),
                Err(_) => DEFAULT_RATE,
            }
        };

        let handicap = slot.userinfo.value("handicap");
        if !handicap.is_empty() && !matches!(handicap.parse::<i32>(), Ok(1..=100)) {
            slot.userinfo.remove("handicap");
        }

        let snapshot_msec = match slot.userinfo.value("snaps") {
            "" => DEFAULT_SNAPSHOT_MSEC,
            snaps => {
                let snaps = snaps.parse::<i64>().unwrap_or(1).clamp(1, fps as i64);
                1000 / snaps as u64
            }
        };
        if snapshot_msec != slot.snapshot_msec {
            slot.snapshot_msec = snapshot_msec;
            slot.next_snapshot_time = now;
        }

        let ip = if slot.addr.is_local() {
            "localhost".to_string()
        } else {
            slot.addr.to_string()
        };
        if let Err(e) = slot.userinfo.set("ip", &ip) {
            warn!("Client {} userinfo rejected: {}", index, e);
            self.drop_slot(index, SlotError::UserinfoOverflow);
            return false;
        }
        true
    }

    fn pure_report(&mut self, index: usize, args: &[String]) {
        if !self.config.pure {
            return;
        }
        let sums = self.content.pure_checksums();
        let verdict = verify_report(
            args,
            sums.as_ref(),
            self.checksum_feed,
            self.checksum_feed_server_id,
        );
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };

        match verdict {
            PureVerdict::Outdated => debug!("Client {} sent an outdated pure report", index),
            PureVerdict::Valid => {
                slot.got_pure_report = true;
                slot.pure_authentic = true;
            }
            PureVerdict::Invalid(e) => {
                warn!("Client {} failed pure validation: {}", index, e);
                slot.got_pure_report = true;
                slot.pure_authentic = false;
                // One last snapshot carries the reason before the slot goes away
                self.send_message(index, true);
                self.drop_slot(index, SlotError::Integrity(e));
            }
        }
    }

    fn begin_download(&mut self, index: usize, file: &str) {
        let result = open_download(self.content.as_ref(), file, self.config.allow_download);
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        if let Some(previous) = slot.download.take() {
            debug!("Client {} abandoned download of {}", index, previous.name());
        }
        slot.download_gamestate_sent = false;

        match result {
            Ok(session) => {
                slot.download_refusal = None;
                slot.download = Some(session);
            }
            Err(refusal) => {
                info!("Client {} download refused: {}", index, refusal);
                slot.download_refusal = Some(refusal.to_string());
            }
        }
    }

    fn next_download(&mut self, index: usize, block: Option<&String>) {
        let now = self.time;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        let Some(session) = slot.download.as_mut() else {
            return;
        };
        let Some(block) = block.and_then(|b| b.parse::<u32>().ok()) else {
            self.drop_slot(index, SlotError::BrokenDownload);
            return;
        };

        match session.acknowledge(block, now) {
            BlockAck::Advanced => {}
            BlockAck::Finished => {
                info!("Client {} finished download of {}", index, session.name());
                slot.download = None;
                self.send_gamestate(index);
                if let Some(slot) = self.clients.get_mut(index) {
                    slot.download_gamestate_sent = true;
                }
            }
            BlockAck::OutOfOrder => {
                debug!("Client {} acknowledged block {} out of order", index, block);
                self.drop_slot(index, SlotError::BrokenDownload);
            }
        }
    }

    fn save_position(&mut self, index: usize) {
        let Some(slot) = self.clients.get(index) else {
            return;
        };
        let guid = slot.userinfo.value("cl_guid").to_string();
        if !shared::is_valid_guid(&guid) {
            return;
        }
        let Some(position) = self.game.position(index) else {
            return;
        };
        let reply = match self.store.save(&self.map, &guid, &position) {
            Ok(()) => "print \"Position saved.\n\"",
            Err(e) => {
                warn!("Could not save position of client {}: {}", index, e);
                "print \"Position could not be saved.\n\""
            }
        };
        self.send_server_command(Some(index), reply);
    }

    pub(crate) fn load_position(&mut self, index: usize) {
        let Some(slot) = self.clients.get(index) else {
            return;
        };
        let guid = slot.userinfo.value("cl_guid").to_string();
        if !shared::is_valid_guid(&guid) {
            return;
        }
        match self.store.load(&self.map, &guid) {
            Ok(Some(position)) => {
                debug!("Restoring position of client {}", index);
                self.game.set_position(index, position);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load position of client {}: {}", index, e),
        }
    }

    fn user_move(&mut self, index: usize, movement: UserMove) {
        let now = self.time;
        let pure = self.config.pure;
        if movement.cmds.is_empty() || movement.cmds.len() > MAX_PACKET_USERCMDS {
            debug!(
                "Client {} sent {} user commands, ignored",
                index,
                movement.cmds.len()
            );
            return;
        }

        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        slot.delta_message = movement.delta.then_some(slot.message_acknowledge);
        let acknowledged = slot.message_acknowledge;
        slot.record_acked(acknowledged, now);

        if pure && !slot.pure_authentic && !slot.got_pure_report {
            if slot.state == ClientState::Active {
                debug!("Client {} has not sent a pure report, resending gamestate", index);
                self.send_gamestate(index);
            }
            return;
        }

        if slot.state == ClientState::Primed {
            self.client_enter_world(index, movement.cmds[0]);
        }

        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        if pure && !slot.pure_authentic {
            self.drop_slot(index, SlotError::Unvalidated);
            return;
        }
        if slot.state != ClientState::Active {
            slot.delta_message = None;
            return;
        }

        let newest = movement.cmds[movement.cmds.len() - 1].server_time;
        for cmd in movement.cmds {
            let Some(slot) = self.clients.get_mut(index) else {
                return;
            };
            if cmd.server_time > newest || cmd.server_time <= slot.last_usercmd.server_time {
                continue;
            }
            slot.last_usercmd = cmd;
            self.game.client_think(index, &cmd);
        }
    }

    /// Moves a primed client into the world
    pub(crate) fn client_enter_world(&mut self, index: usize, cmd: UserCmd) {
        let now = self.time;
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        info!("Client {} ({}) entered the world", index, slot.name);
        slot.state = ClientState::Active;
        slot.delta_message = None;
        slot.next_snapshot_time = now;
        slot.last_usercmd = cmd;
        let updated = std::mem::take(&mut slot.cs_updated);

        for cs in updated {
            let command = format!("cs {} {}\n", cs, quote(self.config_string(cs)));
            if !self.add_reliable(index, &command) {
                return;
            }
        }
        self.game.client_begin(index);
    }

    /// Bots skip the gamestate exchange
    pub(crate) fn bot_enter_world(&mut self, index: usize) {
        if let Some(slot) = self.clients.get_mut(index) {
            slot.state = ClientState::Primed;
        }
        self.client_enter_world(index, UserCmd::default());
    }

    /// Everything a client needs to start a new epoch
    pub(crate) fn gamestate_message(&self, index: usize) -> Option<ServerMessage> {
        let slot = self.clients.get(index)?;
        let mut message = pending_message(slot);
        message.ops.push(ServerOp::Gamestate(Gamestate {
            reliable_sequence: slot.reliable.sequence(),
            config_strings: self
                .config_strings
                .iter()
                .map(|(cs, value)| (*cs, value.clone()))
                .collect(),
            baselines: self.game.baselines(),
            client_num: index as u16,
            checksum_feed: self.checksum_feed,
        }));
        Some(message)
    }

    /// Sends the gamestate and moves the client to `Primed`
    pub(crate) fn send_gamestate(&mut self, index: usize) {
        let Some(message) = self.gamestate_message(index) else {
            return;
        };
        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        debug!("Sending gamestate to client {}", index);
        slot.state = ClientState::Primed;
        slot.got_pure_report = false;
        slot.pure_authentic = false;
        slot.cs_updated.clear();
        slot.gamestate_message_num = Some(slot.netchan.outgoing_sequence());
        self.transmit(index, &message);
    }

    /// Sends the regular per-snapshot message
    pub(crate) fn send_client_message(&mut self, index: usize) {
        self.send_message(index, false);
    }

    fn send_message(&mut self, index: usize, force_snapshot: bool) {
        let now = self.time;
        let bounds = self.config.rate_bounds();
        let Some(slot) = self.clients.get(index) else {
            return;
        };
        let payload = (force_snapshot || slot.state == ClientState::Active)
            .then(|| self.game.snapshot(index));

        let Some(slot) = self.clients.get_mut(index) else {
            return;
        };
        let mut message = pending_message(slot);
        if let Some(payload) = payload {
            message.ops.push(ServerOp::Snapshot(Snapshot {
                server_time: now,
                delta_from: slot.delta_message,
                payload,
            }));
        }
        if let Some(refusal) = slot.download_refusal.take() {
            message.ops.push(ServerOp::DownloadRefused { message: refusal });
        }
        let budget = blocks_per_snapshot(slot.rate, slot.snapshot_msec, bounds);
        if let Some(session) = slot.download.as_mut() {
            message.ops.extend(
                session
                    .next_blocks(now, budget)
                    .into_iter()
                    .map(ServerOp::Download),
            );
        }
        self.transmit(index, &message);
    }

    /// Starts recording a client's message stream
    pub fn start_demo(&mut self, index: usize) -> Result<PathBuf, String> {
        let slot = self
            .clients
            .get(index)
            .ok_or_else(|| format!("Bad client slot: {}", index))?;
        if slot.state != ClientState::Active || slot.is_bot() {
            return Err(format!("Client {} is not active", index));
        }
        if slot.demo.is_some() {
            return Err(format!("Already recording client {}", index));
        }

        let sequence = slot.netchan.outgoing_sequence() - 1;
        let file_name = demo_file_name(index, &slot.name, self.time);
        let header = self
            .gamestate_message(index)
            .ok_or_else(|| format!("Bad client slot: {}", index))?;
        let data = encode_server_packet(sequence, &header).map_err(|e| e.to_string())?;
        let recorder = DemoRecorder::start(&self.config.demo_dir, &file_name, sequence, &data)
            .map_err(|e| e.to_string())?;
        let path = recorder.path().to_path_buf();

        if let Some(slot) = self.clients.get_mut(index) {
            slot.demo = Some(recorder);
        }
        Ok(path)
    }

    /// Finishes a recording; `None` if the client was not being recorded
    pub fn stop_demo(&mut self, index: usize) -> Option<io::Result<PathBuf>> {
        let recorder = self.clients.get_mut(index)?.demo.take()?;
        Some(recorder.stop())
    }
}

/// A message carrying the acknowledgement and every unacknowledged command
fn pending_message(slot: &crate::client_manager::ClientSlot) -> ServerMessage {
    ServerMessage {
        reliable_acknowledge: slot.last_client_command,
        commands: slot
            .reliable
            .pending()
            .map(|(sequence, text)| ReliableCommand {
                sequence,
                text: text.to_string(),
            })
            .collect(),
        ops: Vec::new(),
    }
}
