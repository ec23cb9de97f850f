//! Game rules seam
//!
//! The connection layer never simulates anything itself. It tells the rules
//! who connected, entered, left or sent input, and asks them for snapshot
//! payloads. `ArenaGame` is a small free-movement implementation used by the
//! binary and the tests.

use crate::persistence::SavedPosition;
use bincode::serialize;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::packet::Baseline;
use shared::{InfoString, UserCmd};
use std::collections::HashMap;

/// Units per second at full forward input
pub const MOVE_SPEED: f32 = 320.0;

/// Something the rules want told to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// `print` to one client, or to everyone when `target` is `None`
    Print { target: Option<usize>, text: String },
}

pub trait GameRules: Send {
    /// Accepts or refuses a connection and may rewrite its userinfo
    ///
    /// An `Err` carries the text shown to the refused client.
    fn client_connect(
        &mut self,
        client: usize,
        userinfo: &mut InfoString,
        first_time: bool,
        is_bot: bool,
    ) -> Result<(), String>;

    fn client_begin(&mut self, client: usize);

    fn client_disconnect(&mut self, client: usize);

    fn client_userinfo_changed(&mut self, client: usize, userinfo: &InfoString);

    fn client_think(&mut self, client: usize, cmd: &UserCmd);

    /// Handles a reliable command the connection layer does not know
    fn client_command(&mut self, client: usize, args: &[String]) -> Vec<GameEvent>;

    fn run_frame(&mut self, time: u64);

    fn baselines(&self) -> Vec<Baseline>;

    /// Opaque world state for one client's snapshot
    fn snapshot(&self, client: usize) -> Vec<u8>;

    fn score(&self, client: usize) -> i32;

    fn position(&self, client: usize) -> Option<SavedPosition>;

    fn set_position(&mut self, client: usize, position: SavedPosition);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub client: u16,
    pub name: String,
    pub origin: [f32; 3],
    pub angles: [f32; 3],
    pub score: i32,
}

/// Free movement on an open plane
#[derive(Debug, Default)]
pub struct ArenaGame {
    pub time: u64,
    players: HashMap<usize, PlayerState>,
    /// Players that connected but have not entered the world yet
    pending: HashMap<usize, PlayerState>,
    last_think: HashMap<usize, u64>,
}

impl ArenaGame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn player(&self, client: usize) -> Option<&PlayerState> {
        self.players.get(&client)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    fn spawn_point(client: usize) -> [f32; 3] {
        [64.0 * client as f32, 0.0, 24.0]
    }
}

impl GameRules for ArenaGame {
    fn client_connect(
        &mut self,
        client: usize,
        userinfo: &mut InfoString,
        first_time: bool,
        is_bot: bool,
    ) -> Result<(), String> {
        let name = match userinfo.value("name") {
            "" => "UnnamedPlayer".to_string(),
            name => name.to_string(),
        };
        userinfo
            .set("name", &name)
            .map_err(|e| format!("Bad userinfo: {}", e))?;

        let state = self
            .players
            .remove(&client)
            .filter(|_| !first_time)
            .unwrap_or_else(|| PlayerState {
                client: client as u16,
                name,
                origin: Self::spawn_point(client),
                ..PlayerState::default()
            });
        debug!(
            "Game accepted client {} (first time: {}, bot: {})",
            client, first_time, is_bot
        );
        self.pending.insert(client, state);
        Ok(())
    }

    fn client_begin(&mut self, client: usize) {
        let state = self.pending.remove(&client).unwrap_or_else(|| PlayerState {
            client: client as u16,
            origin: Self::spawn_point(client),
            ..PlayerState::default()
        });
        info!("{} entered the game", state.name);
        self.players.insert(client, state);
    }

    fn client_disconnect(&mut self, client: usize) {
        self.players.remove(&client);
        self.pending.remove(&client);
        self.last_think.remove(&client);
    }

    fn client_userinfo_changed(&mut self, client: usize, userinfo: &InfoString) {
        let name = userinfo.value("name").to_string();
        for map in [&mut self.players, &mut self.pending] {
            if let Some(player) = map.get_mut(&client) {
                player.name = name.clone();
            }
        }
    }

    fn client_think(&mut self, client: usize, cmd: &UserCmd) {
        let Some(player) = self.players.get_mut(&client) else {
            return;
        };
        let previous = self.last_think.insert(client, cmd.server_time);
        let dt = previous
            .map(|t| cmd.server_time.saturating_sub(t).min(200) as f32 / 1000.0)
            .unwrap_or(0.0);

        let yaw = cmd.angles[1].to_radians();
        let forward = cmd.forward as f32 / 127.0;
        let right = cmd.right as f32 / 127.0;
        player.origin[0] += (yaw.cos() * forward + yaw.sin() * right) * MOVE_SPEED * dt;
        player.origin[1] += (yaw.sin() * forward - yaw.cos() * right) * MOVE_SPEED * dt;
        player.origin[2] = (player.origin[2] + cmd.up as f32 / 127.0 * MOVE_SPEED * dt).max(0.0);
        player.angles = cmd.angles;
    }

    fn client_command(&mut self, client: usize, args: &[String]) -> Vec<GameEvent> {
        let name = self
            .players
            .get(&client)
            .map(|p| p.name.clone())
            .unwrap_or_default();

        match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("say") => vec![GameEvent::Print {
                target: None,
                text: format!("{}: {}\n", name, args[1..].join(" ")),
            }],
            Some("score") => vec![GameEvent::Print {
                target: Some(client),
                text: format!("score {}\n", self.score(client)),
            }],
            Some(other) => vec![GameEvent::Print {
                target: Some(client),
                text: format!("unknown cmd {}\n", other),
            }],
            None => Vec::new(),
        }
    }

    fn run_frame(&mut self, time: u64) {
        self.time = time;
    }

    fn baselines(&self) -> Vec<Baseline> {
        let mut clients: Vec<_> = self.players.keys().copied().collect();
        clients.sort_unstable();
        clients
            .into_iter()
            .map(|client| Baseline {
                number: client as u16,
                data: self.snapshot(client),
            })
            .collect()
    }

    fn snapshot(&self, _client: usize) -> Vec<u8> {
        let mut players: Vec<&PlayerState> = self.players.values().collect();
        players.sort_by_key(|p| p.client);
        serialize(&players).unwrap_or_default()
    }

    fn score(&self, client: usize) -> i32 {
        self.players.get(&client).map(|p| p.score).unwrap_or(0)
    }

    fn position(&self, client: usize) -> Option<SavedPosition> {
        self.players
            .get(&client)
            .or_else(|| self.pending.get(&client))
            .map(|p| SavedPosition {
                origin: p.origin,
                angles: p.angles,
            })
    }

    fn set_position(&mut self, client: usize, position: SavedPosition) {
        for map in [&mut self.players, &mut self.pending] {
            if let Some(player) = map.get_mut(&client) {
                player.origin = position.origin;
                player.angles = position.angles;
            }
        }
    }
}
