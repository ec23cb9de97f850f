//! Operator commands
//!
//! Reached through rcon. Every command acts on the slot table through the
//! same admission and drop paths the protocol uses and returns its console
//! output as text.

use crate::client_manager::ClientState;
use crate::context::ServerContext;
use crate::persistence::SavedPosition;
use log::info;
use shared::command::{quote, tokenize};
use shared::AddrKind;
use std::fmt::Write;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorCommand {
    Status,
    Kick,
    Ban,
    Unban,
    Say,
    Tell,
    DumpUser,
    Heartbeat,
    MapRestart,
    Map,
    Teleport,
    StartDemo,
    StopDemo,
    AddBot,
}

const COMMANDS: &[(&str, OperatorCommand)] = &[
    ("status", OperatorCommand::Status),
    ("kick", OperatorCommand::Kick),
    ("ban", OperatorCommand::Ban),
    ("unban", OperatorCommand::Unban),
    ("say", OperatorCommand::Say),
    ("tell", OperatorCommand::Tell),
    ("dumpuser", OperatorCommand::DumpUser),
    ("heartbeat", OperatorCommand::Heartbeat),
    ("map_restart", OperatorCommand::MapRestart),
    ("map", OperatorCommand::Map),
    ("teleport", OperatorCommand::Teleport),
    ("startserverdemo", OperatorCommand::StartDemo),
    ("stopserverdemo", OperatorCommand::StopDemo),
    ("addbot", OperatorCommand::AddBot),
];

impl ServerContext {
    /// Runs one console line and returns what it printed
    pub fn execute_operator_command(&mut self, line: &str) -> String {
        let args = tokenize(line);
        let Some(name) = args.first() else {
            return String::new();
        };
        let Some(command) = COMMANDS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, c)| *c)
        else {
            return format!("Unknown command: {}\n", name);
        };
        info!("Operator command: {}", line);

        let rest = args.get(1..).unwrap_or_default();
        match command {
            OperatorCommand::Status => self.status_text(),
            OperatorCommand::Kick => self.kick(rest),
            OperatorCommand::Ban => self.ban(rest),
            OperatorCommand::Unban => self.unban(rest),
            OperatorCommand::Say => {
                if rest.is_empty() {
                    return "Usage: say <text>\n".to_string();
                }
                let text = format!("console: {}\n", rest.join(" "));
                self.send_server_command(None, &format!("chat {}", quote(&text)));
                String::new()
            }
            OperatorCommand::Tell => self.tell(rest),
            OperatorCommand::DumpUser => self.dump_user(rest),
            OperatorCommand::Heartbeat => {
                self.force_heartbeat();
                "Heartbeat requested\n".to_string()
            }
            OperatorCommand::MapRestart => {
                self.map_restart();
                String::new()
            }
            OperatorCommand::Map => match rest.first() {
                Some(map) => {
                    self.spawn_server(map);
                    String::new()
                }
                None => "Usage: map <name>\n".to_string(),
            },
            OperatorCommand::Teleport => self.teleport(rest),
            OperatorCommand::StartDemo => self.demo_command(rest, true),
            OperatorCommand::StopDemo => self.demo_command(rest, false),
            OperatorCommand::AddBot => match rest.first() {
                Some(name) => match self.add_bot(name) {
                    Ok(index) => format!("Bot {} added to slot {}\n", name, index),
                    Err(e) => format!("Cannot add bot: {}\n", e),
                },
                None => "Usage: addbot <name>\n".to_string(),
            },
        }
    }

    /// Resolves a slot number or a case-insensitive (partial) player name
    pub fn find_player(&self, arg: &str) -> Result<usize, String> {
        if let Ok(index) = arg.parse::<usize>() {
            return match self.clients.get(index) {
                Some(slot) if slot.state >= ClientState::Connected => Ok(index),
                Some(_) => Err(format!("Client {} is not active\n", index)),
                None => Err(format!("Bad client slot: {}\n", index)),
            };
        }

        let wanted = arg.to_ascii_lowercase();
        let live: Vec<(usize, String)> = self
            .clients
            .iter()
            .filter(|(_, slot)| slot.state >= ClientState::Connected)
            .map(|(index, slot)| (index, slot.name.to_ascii_lowercase()))
            .collect();

        let exact: Vec<usize> = live
            .iter()
            .filter(|(_, name)| *name == wanted)
            .map(|(index, _)| *index)
            .collect();
        if let [index] = exact[..] {
            return Ok(index);
        }

        let partial: Vec<usize> = live
            .iter()
            .filter(|(_, name)| name.contains(&wanted))
            .map(|(index, _)| *index)
            .collect();
        match partial[..] {
            [] => Err(format!("Player {} is not on the server\n", arg)),
            [index] => Ok(index),
            _ => Err(format!("Player name {} is ambiguous\n", arg)),
        }
    }

    fn status_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "map: {}", self.map);
        let _ = writeln!(out, "num score ping name            address               rate");
        let _ = writeln!(out, "--- ----- ---- --------------- --------------------- -----");
        for (index, slot) in self.clients.iter() {
            if slot.is_free() {
                continue;
            }
            let ping = match slot.state {
                ClientState::Zombie => "ZMBI".to_string(),
                ClientState::Connected | ClientState::Primed => "CNCT".to_string(),
                _ => slot.ping.to_string(),
            };
            let _ = writeln!(
                out,
                "{:>3} {:>5} {:>4} {:<15} {:<21} {:>5}",
                index,
                self.game.score(index),
                ping,
                slot.name,
                slot.addr.to_string(),
                slot.rate
            );
        }
        out
    }

    fn kick(&mut self, args: &[String]) -> String {
        let Some(target) = args.first() else {
            return "Usage: kick <client|all|allbots> [reason]\n".to_string();
        };
        let reason = match args.get(1..) {
            Some(words) if !words.is_empty() => format!("was kicked: {}", words.join(" ")),
            _ => "was kicked".to_string(),
        };

        let everyone = target.eq_ignore_ascii_case("all");
        let bots_only = target.eq_ignore_ascii_case("allbots");
        if everyone || bots_only {
            let victims: Vec<usize> = self
                .clients
                .iter()
                .filter(|(_, slot)| slot.state >= ClientState::Connected)
                .filter(|(_, slot)| slot.addr.kind != AddrKind::Loopback)
                .filter(|(_, slot)| !bots_only || slot.is_bot())
                .map(|(index, _)| index)
                .collect();
            for index in &victims {
                self.drop_client(*index, &reason);
            }
            return format!("Kicked {} clients\n", victims.len());
        }

        let index = match self.find_player(target) {
            Ok(index) => index,
            Err(message) => return message,
        };
        if self
            .clients
            .get(index)
            .is_some_and(|slot| slot.addr.kind == AddrKind::Loopback)
        {
            return "Cannot kick host player\n".to_string();
        }
        self.drop_client(index, &reason);
        String::new()
    }

    fn ban(&mut self, args: &[String]) -> String {
        let Some(ip) = args.first().and_then(|a| a.parse::<IpAddr>().ok()) else {
            return "Usage: ban <ip>\n".to_string();
        };
        if !self.bans.contains(&ip) {
            self.bans.push(ip);
        }

        let victims: Vec<usize> = self
            .clients
            .iter()
            .filter(|(_, slot)| slot.state >= ClientState::Connected)
            .filter(|(_, slot)| slot.addr.kind == AddrKind::Remote && slot.addr.ip() == ip)
            .map(|(index, _)| index)
            .collect();
        for index in victims {
            self.drop_client(index, "was banned");
        }
        format!("Banned {}\n", ip)
    }

    fn unban(&mut self, args: &[String]) -> String {
        let Some(ip) = args.first().and_then(|a| a.parse::<IpAddr>().ok()) else {
            return "Usage: unban <ip>\n".to_string();
        };
        let before = self.bans.len();
        self.bans.retain(|banned| *banned != ip);
        if self.bans.len() == before {
            format!("{} is not banned\n", ip)
        } else {
            format!("Unbanned {}\n", ip)
        }
    }

    fn tell(&mut self, args: &[String]) -> String {
        if args.len() < 2 {
            return "Usage: tell <client> <text>\n".to_string();
        }
        let index = match self.find_player(&args[0]) {
            Ok(index) => index,
            Err(message) => return message,
        };
        let text = format!("console: {}\n", args[1..].join(" "));
        self.send_server_command(Some(index), &format!("chat {}", quote(&text)));
        String::new()
    }

    fn dump_user(&self, args: &[String]) -> String {
        let Some(target) = args.first() else {
            return "Usage: dumpuser <client>\n".to_string();
        };
        let index = match self.find_player(target) {
            Ok(index) => index,
            Err(message) => return message,
        };
        let Some(slot) = self.clients.get(index) else {
            return String::new();
        };
        let mut out = String::from("userinfo\n--------\n");
        for (key, value) in slot.userinfo.iter() {
            let _ = writeln!(out, "{:<20}{}", key, value);
        }
        out
    }

    fn teleport(&mut self, args: &[String]) -> String {
        let usage = "Usage: teleport <client> <x> <y> <z>\n".to_string();
        if args.len() != 4 {
            return usage;
        }
        let index = match self.find_player(&args[0]) {
            Ok(index) => index,
            Err(message) => return message,
        };
        let coords: Result<Vec<f32>, _> = args[1..].iter().map(|a| a.parse::<f32>()).collect();
        let Ok(coords) = coords else {
            return usage;
        };

        let mut position = self.game.position(index).unwrap_or_default();
        position.origin = [coords[0], coords[1], coords[2]];
        self.game.set_position(index, position);
        let SavedPosition { origin, .. } = position;
        format!(
            "Teleported client {} to {} {} {}\n",
            index, origin[0], origin[1], origin[2]
        )
    }

    fn demo_command(&mut self, args: &[String], start: bool) -> String {
        let Some(target) = args.first() else {
            return if start {
                "Usage: startserverdemo <client|all>\n".to_string()
            } else {
                "Usage: stopserverdemo <client|all>\n".to_string()
            };
        };

        let targets: Vec<usize> = if target.eq_ignore_ascii_case("all") {
            self.clients
                .iter()
                .filter(|(_, slot)| slot.state == ClientState::Active && !slot.is_bot())
                .filter(|(_, slot)| start || slot.demo.is_some())
                .map(|(index, _)| index)
                .collect()
        } else {
            match self.find_player(target) {
                Ok(index) => vec![index],
                Err(message) => return message,
            }
        };

        let mut out = String::new();
        for index in targets {
            if start {
                match self.start_demo(index) {
                    Ok(path) => {
                        let _ = writeln!(out, "Recording client {} to {}", index, path.display());
                    }
                    Err(e) => {
                        let _ = writeln!(out, "{}", e);
                    }
                }
            } else {
                match self.stop_demo(index) {
                    Some(Ok(path)) => {
                        let _ = writeln!(out, "Stopped demo {}", path.display());
                    }
                    Some(Err(e)) => {
                        let _ = writeln!(out, "Demo of client {} failed: {}", index, e);
                    }
                    None => {
                        let _ = writeln!(out, "Client {} is not being recorded", index);
                    }
                }
            }
        }
        out
    }
}
