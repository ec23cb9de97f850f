//! Client slot table for the connection layer
//!
//! This module owns the fixed-capacity registry of connections, including:
//! - The per-slot connection record (state, channel, userinfo, reliable ring)
//! - Lookup of slots by address and qport for sequenced traffic
//! - Timeout handling and zombie expiry
//! - Ping calculation from acknowledged message frames
//!
//! Slots are addressed by their index, which stays a stable handle for the
//! whole lifetime of a connection. A slot only ever changes state through
//! the transitions in `ClientState`.

use crate::demo::DemoRecorder;
use crate::download::DownloadSession;
use crate::flood::FloodGuard;
use crate::netchan::Netchan;
use crate::reliable::ReliableChannel;
use log::{debug, info};
use shared::{InfoString, NetAddr, UserCmd, PACKET_BACKUP};
use std::collections::BTreeSet;

/// Frames a silent client may exceed the timeout before it is dropped
pub const TIMEOUT_FRAMES: u32 = 5;

/// Ping reported for clients without a usable measurement
pub const MAX_PING: u64 = 999;

/// Lifecycle of a slot
///
/// Ordered so that `state >= ClientState::Connected` reads as "has a live
/// connection": `Free -> Connected -> Primed -> Active -> Zombie -> Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientState {
    /// Unused slot
    Free,
    /// Dropped; kept alive only to retransmit the final disconnect notice
    Zombie,
    /// Admitted, waiting for its first sequenced packet
    Connected,
    /// Gamestate sent, waiting for the first user command
    Primed,
    /// In the world, receiving snapshots
    Active,
}

/// Send and acknowledge times of one outgoing message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFrame {
    pub sent: u64,
    pub acked: Option<u64>,
}

/// Connection record of one slot
///
/// Each slot tracks:
/// - Connection identity (address, qport, challenge) and lifecycle state
/// - Reliable command rings in both directions and message acknowledgement
/// - Snapshot cadence, rate and the download session multiplexed into it
/// - Pure validation flags and an optional demo recording
#[derive(Debug)]
pub struct ClientSlot {
    pub state: ClientState,
    pub addr: NetAddr,
    pub netchan: Netchan,
    pub challenge: i32,
    pub userinfo: InfoString,
    /// Userinfo received during the flood delay, applied by the frame timer
    pub pending_userinfo: Option<String>,
    pub name: String,

    /// Server to client reliable commands
    pub reliable: ReliableChannel,
    /// Last client to server reliable command executed
    pub last_client_command: i32,
    pub last_client_command_text: String,

    /// Last server message the client reported receiving
    pub message_acknowledge: i32,
    /// Sequence the gamestate went out with; `None` forces a resend
    pub gamestate_message_num: Option<i32>,
    /// Message the client wants snapshots delta compressed against
    pub delta_message: Option<i32>,
    pub last_usercmd: UserCmd,
    /// Configuration strings changed while the client was primed
    pub cs_updated: BTreeSet<u16>,

    pub next_snapshot_time: u64,
    pub snapshot_msec: u64,
    pub rate: u32,
    pub frames: [MessageFrame; PACKET_BACKUP],
    pub ping: u64,

    pub last_packet_time: u64,
    pub last_connect_time: u64,
    pub next_userinfo_time: u64,
    pub timeout_count: u32,
    pub flood: FloodGuard,

    pub download: Option<DownloadSession>,
    /// Refusal text waiting to be delivered in the next message
    pub download_refusal: Option<String>,
    /// Set when a finished download already triggered a gamestate resend
    pub download_gamestate_sent: bool,

    pub got_pure_report: bool,
    pub pure_authentic: bool,

    pub demo: Option<DemoRecorder>,
}

impl ClientSlot {
    /// Creates an unused slot
    pub fn free() -> Self {
        Self {
            state: ClientState::Free,
            addr: NetAddr::bot(),
            netchan: Netchan::new(0),
            challenge: 0,
            userinfo: InfoString::new(),
            pending_userinfo: None,
            name: String::new(),
            reliable: ReliableChannel::new(),
            last_client_command: 0,
            last_client_command_text: String::new(),
            message_acknowledge: 0,
            gamestate_message_num: None,
            delta_message: None,
            last_usercmd: UserCmd::default(),
            cs_updated: BTreeSet::new(),
            next_snapshot_time: 0,
            snapshot_msec: 50,
            rate: 3000,
            frames: [MessageFrame::default(); PACKET_BACKUP],
            ping: MAX_PING,
            last_packet_time: 0,
            last_connect_time: 0,
            next_userinfo_time: 0,
            timeout_count: 0,
            flood: FloodGuard::new(),
            download: None,
            download_refusal: None,
            download_gamestate_sent: false,
            got_pure_report: false,
            pure_authentic: false,
            demo: None,
        }
    }

    /// Creates a freshly admitted connection
    ///
    /// Every counter starts from zero, including both reliable sequences, and
    /// the gamestate is marked as never sent.
    pub fn connected(addr: NetAddr, qport: u16, challenge: i32, now: u64) -> Self {
        Self {
            state: ClientState::Connected,
            addr,
            netchan: Netchan::new(qport),
            challenge,
            next_snapshot_time: now,
            last_packet_time: now,
            last_connect_time: now,
            ..Self::free()
        }
    }

    pub fn is_bot(&self) -> bool {
        self.addr.kind == shared::AddrKind::Bot
    }

    pub fn is_free(&self) -> bool {
        self.state == ClientState::Free
    }

    /// Records the send time of an outgoing message
    pub fn record_sent(&mut self, sequence: i32, now: u64) {
        let frame = &mut self.frames[frame_index(sequence)];
        frame.sent = now;
        frame.acked = None;
    }

    /// Stamps the acknowledgement time of a message the client received
    pub fn record_acked(&mut self, sequence: i32, now: u64) {
        let frame = &mut self.frames[frame_index(sequence)];
        if frame.acked.is_none() {
            frame.acked = Some(now);
        }
    }

    /// Mean round trip of acknowledged frames, capped at `MAX_PING`
    pub fn calc_ping(&self) -> u64 {
        if self.state != ClientState::Active {
            return MAX_PING;
        }
        if self.is_bot() {
            return 0;
        }
        let (total, count) = self
            .frames
            .iter()
            .filter_map(|f| f.acked.map(|acked| acked.saturating_sub(f.sent)))
            .fold((0u64, 0u64), |(total, count), rtt| (total + rtt, count + 1));
        if count == 0 {
            return MAX_PING;
        }
        (total / count).min(MAX_PING)
    }
}

fn frame_index(sequence: i32) -> usize {
    sequence.rem_euclid(PACKET_BACKUP as i32) as usize
}

/// Fixed-capacity arena of client slots
///
/// The ClientManager never grows or shrinks after creation; admission finds a
/// free slot and a dropped connection returns its slot through the zombie
/// state. Lookups only consider slots that are not free.
pub struct ClientManager {
    slots: Vec<ClientSlot>,
}

impl ClientManager {
    /// Creates a table with `capacity` free slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| ClientSlot::free()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&ClientSlot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ClientSlot> {
        self.slots.get_mut(index)
    }

    /// Replaces the record of a slot, used for admission and freeing
    pub fn replace(&mut self, index: usize, slot: ClientSlot) -> Option<ClientSlot> {
        self.slots
            .get_mut(index)
            .map(|current| std::mem::replace(current, slot))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClientSlot)> {
        self.slots.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ClientSlot)> {
        self.slots.iter_mut().enumerate()
    }

    /// Finds the slot that owns a sequenced packet
    ///
    /// Matches host and qport; the port may differ when a router rewrote it.
    pub fn find_by_channel(&self, addr: &NetAddr, qport: u16) -> Option<usize> {
        self.iter()
            .find(|(_, slot)| {
                !slot.is_free() && slot.addr.compare_base(addr) && slot.netchan.qport == qport
            })
            .map(|(index, _)| index)
    }

    /// Finds the slot a `connect` from this address would take over
    pub fn find_reconnect(&self, addr: &NetAddr, qport: u16) -> Option<usize> {
        self.iter()
            .find(|(_, slot)| {
                !slot.is_free()
                    && slot.addr.compare_base(addr)
                    && (slot.netchan.qport == qport || slot.addr.port() == addr.port())
            })
            .map(|(index, _)| index)
    }

    /// First free slot at or after `start`
    pub fn first_free(&self, start: usize) -> Option<usize> {
        (start..self.slots.len()).find(|&i| self.slots[i].is_free())
    }

    /// Other live connections from the same host
    pub fn count_from_host(&self, addr: &NetAddr, except: Option<usize>) -> usize {
        self.iter()
            .filter(|(index, slot)| {
                Some(*index) != except && !slot.is_free() && slot.addr.compare_base(addr)
            })
            .count()
    }

    /// Slots at or above `state`
    pub fn count_at_least(&self, state: ClientState) -> usize {
        self.slots.iter().filter(|s| s.state >= state).count()
    }

    /// Live connections that are not bots
    pub fn humans(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state >= ClientState::Connected && !s.is_bot())
            .count()
    }

    pub fn bots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state >= ClientState::Connected && s.is_bot())
            .count()
    }

    /// Expires zombies and reports connections that went silent
    ///
    /// Zombies idle for `zombie_msec` are freed here. A connection is only
    /// reported after it exceeded `timeout_msec` on more than
    /// `TIMEOUT_FRAMES` consecutive calls, which rides out a single long hitch
    /// of the server itself. Packet times in the future are clamped first.
    pub fn check_timeouts(&mut self, now: u64, timeout_msec: u64, zombie_msec: u64) -> Vec<usize> {
        let mut timed_out = Vec::new();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.last_packet_time > now || (slot.is_bot() && slot.state >= ClientState::Connected) {
                slot.last_packet_time = now;
            }

            if slot.state == ClientState::Zombie
                && slot.last_packet_time + zombie_msec < now
            {
                debug!("Going from zombie to free for client {}", index);
                *slot = ClientSlot::free();
                continue;
            }

            if slot.state >= ClientState::Connected && slot.last_packet_time + timeout_msec < now {
                slot.timeout_count += 1;
                if slot.timeout_count > TIMEOUT_FRAMES {
                    info!("Client {} ({}) timed out", index, slot.addr);
                    timed_out.push(index);
                }
            } else {
                slot.timeout_count = 0;
            }
        }

        timed_out
    }

    /// Refreshes the ping of every slot
    pub fn calc_pings(&mut self) {
        for slot in &mut self.slots {
            slot.ping = slot.calc_ping();
        }
    }

    /// Returns the number of slots in use
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    /// Returns true if every slot is free
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
