//! Integration tests for the client and server connection layers
//!
//! Most scenarios pump datagrams between a `ClientSession` and a
//! `ServerContext` in process, which keeps them deterministic. The network
//! tests run the real tokio drivers over loopback UDP.

use client::session::{ClientConfig, ClientSession, ConnectionState};
use server::content::MemoryContent;
use server::game::ArenaGame;
use server::persistence::MemoryStore;
use server::{ClientState, Collaborators, ServerConfig, ServerContext};
use shared::{InfoString, NetAddr, CS_SERVERINFO};

const STEP_MSEC: u64 = 50;

/// A server context with any number of in-process clients
struct Harness {
    ctx: ServerContext,
    clients: Vec<(NetAddr, ClientSession)>,
}

impl Harness {
    fn new(config: ServerConfig) -> Self {
        Self::with_content(config, MemoryContent::new())
    }

    fn with_content(config: ServerConfig, content: MemoryContent) -> Self {
        let collaborators = Collaborators {
            game: Box::new(ArenaGame::new()),
            content: Box::new(content),
            store: Box::new(MemoryStore::new()),
        };
        Self {
            ctx: ServerContext::new(config, collaborators, 42),
            clients: Vec::new(),
        }
    }

    fn add_client(&mut self, addr: &str, config: ClientConfig) -> usize {
        let addr = NetAddr::remote(addr.parse().unwrap());
        self.clients.push((addr, ClientSession::new(config)));
        self.clients.len() - 1
    }

    fn session(&self, client: usize) -> &ClientSession {
        &self.clients[client].1
    }

    fn slot_of(&self, client: usize) -> Option<usize> {
        let (addr, session) = &self.clients[client];
        self.ctx.clients.find_by_channel(addr, session.config.qport)
    }

    fn exchange(&mut self) {
        for (addr, session) in &mut self.clients {
            for data in session.take_outgoing() {
                self.ctx.packet_event(*addr, &data);
            }
        }
        for packet in self.ctx.take_outgoing() {
            if let Some((_, session)) = self.clients.iter_mut().find(|(a, _)| *a == packet.to) {
                session.handle_datagram(&packet.data);
            }
        }
    }

    fn step(&mut self) {
        for (_, session) in &mut self.clients {
            session.frame(STEP_MSEC);
        }
        self.exchange();
        self.ctx.frame(STEP_MSEC);
        self.exchange();
    }

    /// Steps until `done` holds; panics after `limit` steps
    fn run_until<F: Fn(&Harness) -> bool>(&mut self, limit: usize, done: F) {
        for _ in 0..limit {
            if done(self) {
                return;
            }
            self.step();
        }
        assert!(done(self), "condition not reached in {} steps", limit);
    }
}

fn config_named(name: &str) -> ClientConfig {
    ClientConfig::new(name)
}

fn active(h: &Harness, client: usize) -> bool {
    h.session(client).state == ConnectionState::Active
        && h.slot_of(client)
            .and_then(|slot| h.ctx.clients.get(slot))
            .is_some_and(|slot| slot.state == ClientState::Active)
}

/// CONNECTION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    #[test]
    fn client_reaches_active_and_receives_snapshots() {
        let mut h = Harness::new(ServerConfig::default());
        let client = h.add_client("10.0.0.5:27000", config_named("alpha"));

        h.run_until(40, |h| active(h, client));

        let session = h.session(client);
        assert_eq!(session.server_id(), h.ctx.server_id);
        assert_eq!(session.client_num().map(usize::from), h.slot_of(client));
        let server_info = InfoString::parse(session.config_string(CS_SERVERINFO));
        assert_eq!(server_info.value("mapname"), "arena");

        let before = session.snapshots();
        for _ in 0..10 {
            h.step();
        }
        assert!(h.session(client).snapshots() >= before + 8);
    }

    #[test]
    fn full_server_refuses_second_client() {
        let mut config = ServerConfig::default();
        config.max_clients = 1;
        let mut h = Harness::new(config);
        let first = h.add_client("10.0.0.5:27000", config_named("first"));
        h.run_until(40, |h| active(h, first));

        let second = h.add_client("10.0.0.6:27000", config_named("second"));
        h.run_until(10, |h| h.session(second).is_disconnected());
        assert_eq!(
            h.session(second).state,
            ConnectionState::Disconnected("Server is full".to_string())
        );
        assert!(active(&h, first));
    }

    #[test]
    fn kicked_client_receives_reason() {
        let mut h = Harness::new(ServerConfig::default());
        let client = h.add_client("10.0.0.5:27000", config_named("victim"));
        h.run_until(40, |h| active(h, client));

        let output = h.ctx.execute_operator_command("kick victim");
        assert!(output.is_empty(), "{}", output);
        h.run_until(5, |h| h.session(client).is_disconnected());
        assert_eq!(
            h.session(client).state,
            ConnectionState::Disconnected("was kicked".to_string())
        );
        let slot = h.ctx.clients.get(0).unwrap();
        assert!(slot.state <= ClientState::Zombie);
    }

    #[test]
    fn client_disconnect_frees_slot_after_zombie_time() {
        let mut h = Harness::new(ServerConfig::default());
        let client = h.add_client("10.0.0.5:27000", config_named("leaver"));
        h.run_until(40, |h| active(h, client));
        let slot = h.slot_of(client).unwrap();

        h.clients[client].1.disconnect();
        h.exchange();
        assert_eq!(h.ctx.clients.get(slot).unwrap().state, ClientState::Zombie);

        let zombie_steps = (h.ctx.config.zombie_time * 1000 / STEP_MSEC) as usize + 2;
        for _ in 0..zombie_steps {
            h.step();
        }
        assert!(h.ctx.clients.get(slot).unwrap().is_free());
    }

    #[test]
    fn chat_reaches_other_clients() {
        let mut h = Harness::new(ServerConfig::default());
        let a = h.add_client("10.0.0.5:27000", config_named("alpha"));
        let b = h.add_client("10.0.0.6:27000", config_named("bravo"));
        h.run_until(40, |h| active(h, a) && active(h, b));

        h.clients[a].1.add_command("say hello there").unwrap();
        h.run_until(10, |h| {
            h.session(b)
                .executed_commands()
                .iter()
                .any(|c| c.contains("alpha: hello there"))
        });
    }
}

/// EPOCH TESTS
mod epoch_tests {
    use super::*;

    #[test]
    fn map_restart_keeps_clients_in_the_world() {
        let mut h = Harness::new(ServerConfig::default());
        let client = h.add_client("10.0.0.5:27000", config_named("alpha"));
        h.run_until(40, |h| active(h, client));
        let old_id = h.ctx.server_id;
        let gamestates = h.session(client).gamestates();

        h.ctx.map_restart();
        assert_ne!(h.ctx.server_id, old_id);
        h.run_until(20, |h| h.session(client).server_id() == h.ctx.server_id);

        for _ in 0..5 {
            h.step();
        }
        let session = h.session(client);
        assert!(session
            .executed_commands()
            .iter()
            .any(|c| c.trim() == "map_restart"));
        assert_eq!(session.gamestates(), gamestates);
        assert!(active(&h, client));
    }

    #[test]
    fn new_map_resends_gamestate() {
        let mut h = Harness::new(ServerConfig::default());
        let client = h.add_client("10.0.0.5:27000", config_named("alpha"));
        h.run_until(40, |h| active(h, client));

        h.ctx.spawn_server("canyon");
        h.run_until(40, |h| h.session(client).gamestates() >= 2 && active(h, client));

        let session = h.session(client);
        let info = InfoString::parse(session.config_string(CS_SERVERINFO));
        assert_eq!(info.value("mapname"), "canyon");
        assert_eq!(session.server_id(), h.ctx.server_id);
    }
}

/// CONTENT TESTS
mod content_tests {
    use super::*;

    fn archives() -> MemoryContent {
        MemoryContent::new()
            .with_official("pak0", b"base game code".to_vec())
            .with_official("pak1", b"base user interface".to_vec())
            .with_game_code("pak0", "pak1")
            .with_archive("custom", (0..5000u32).map(|i| (i % 251) as u8).collect())
    }

    #[test]
    fn pure_client_proves_archives_and_enters() {
        let mut config = ServerConfig::default();
        config.pure = true;
        let mut h = Harness::with_content(config, archives());
        let client = h.add_client("10.0.0.5:27000", config_named("alpha"));

        h.run_until(40, |h| active(h, client));
        let slot = h.ctx.clients.get(h.slot_of(client).unwrap()).unwrap();
        assert!(slot.pure_authentic);
    }

    #[test]
    fn download_transfers_archive_then_enters() {
        let mut h = Harness::with_content(ServerConfig::default(), archives());
        let mut config = config_named("getter");
        config.downloads = vec!["custom.pk3".to_string()];
        let client = h.add_client("10.0.0.5:27000", config);

        h.run_until(100, |h| active(h, client));

        let session = h.session(client);
        let downloads = session.completed_downloads();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].name, "custom.pk3");
        let expected: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(downloads[0].data, expected);
        assert!(session.gamestates() >= 2);
    }

    #[test]
    fn official_archive_is_refused_but_client_continues() {
        let mut h = Harness::with_content(ServerConfig::default(), archives());
        let mut config = config_named("getter");
        config.downloads = vec!["pak0.pk3".to_string()];
        let client = h.add_client("10.0.0.5:27000", config);

        h.run_until(60, |h| active(h, client));
        let session = h.session(client);
        assert!(session.completed_downloads().is_empty());
        assert_eq!(session.download_refusals().len(), 1);
        assert!(session.download_refusals()[0].contains("official"));
    }
}

/// PERSISTENCE TESTS
mod persistence_tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn position_survives_reconnect() {
        let mut config = ServerConfig::default();
        config.persistent_positions = true;
        let mut h = Harness::new(config);
        let client_config = config_named("walker");
        let guid = client_config.guid.clone();
        let first = h.add_client("10.0.0.5:27000", client_config.clone());
        h.run_until(40, |h| active(h, first));

        let output = h.ctx.execute_operator_command("teleport walker 100 -200 50.5");
        assert!(!output.starts_with("Usage"), "{}", output);
        h.clients[first].1.disconnect();
        h.exchange();

        let saved = h.ctx.store().load("arena", &guid).unwrap().unwrap();
        assert_approx_eq!(saved.origin[0], 100.0);
        assert_approx_eq!(saved.origin[1], -200.0);
        assert_approx_eq!(saved.origin[2], 50.5);

        let mut again = client_config;
        again.qport = again.qport.wrapping_add(1);
        let second = h.add_client("10.0.0.5:27001", again);
        h.run_until(20, |h| h.session(second).state >= ConnectionState::Connected);

        let slot = h.slot_of(second).unwrap();
        let restored = h.ctx.game().position(slot).unwrap();
        assert_approx_eq!(restored.origin[0], 100.0);
        assert_approx_eq!(restored.origin[1], -200.0);
        assert_approx_eq!(restored.origin[2], 50.5);
    }
}

/// REAL NETWORK TESTS
mod network_tests {
    use super::*;
    use client::network::Client;
    use server::network::{Server, ServerEvent};
    use shared::packet::{decode_oob, encode_oob};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn loopback_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config
    }

    type Running = (
        std::net::SocketAddr,
        tokio::sync::mpsc::UnboundedSender<ServerEvent>,
        tokio::task::JoinHandle<()>,
    );

    async fn start_server() -> Running {
        let context = ServerContext::new(loopback_config(), Collaborators::in_memory(), 3);
        let mut server = Server::with_context(context).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        (addr, handle, task)
    }

    #[tokio::test]
    async fn client_plays_over_udp() {
        let (addr, handle, task) = start_server().await;

        let mut client = Client::new(&addr.to_string(), config_named("udp"))
            .await
            .unwrap();
        let reached = client
            .run_until(Duration::from_secs(5), |s| {
                s.state == ConnectionState::Active && s.snapshots() >= 5
            })
            .await
            .unwrap();
        assert!(reached);
        assert!(client.session().client_num().is_some());

        client.disconnect().await.unwrap();
        handle.send(ServerEvent::Shutdown).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn server_shutdown_disconnects_client() {
        let (addr, handle, task) = start_server().await;

        let mut client = Client::new(&addr.to_string(), config_named("udp"))
            .await
            .unwrap();
        client
            .run_until(Duration::from_secs(5), |s| s.state == ConnectionState::Active)
            .await
            .unwrap();

        handle.send(ServerEvent::Shutdown).unwrap();
        task.await.unwrap();

        let ended = client
            .run_until(Duration::from_secs(2), |s| s.is_disconnected())
            .await
            .unwrap();
        assert!(ended);
        assert_eq!(
            client.session().state,
            ConnectionState::Disconnected("Server shutdown".to_string())
        );
    }

    #[test]
    fn getinfo_over_udp() {
        tokio_test::block_on(async {
            let (addr, handle, task) = start_server().await;

            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.send_to(&encode_oob("getinfo xyz"), addr).await.unwrap();

            let mut buffer = [0u8; 1400];
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
                .await
                .unwrap()
                .unwrap();
            let reply = decode_oob(&buffer[..len]).unwrap();
            let (command, info) = reply.split_once('\n').unwrap();
            assert_eq!(command, "infoResponse");
            let info = InfoString::parse(info.trim_end());
            assert_eq!(info.value("challenge"), "xyz");
            assert_eq!(info.value("mapname"), "arena");

            handle.send(ServerEvent::Shutdown).unwrap();
            task.await.unwrap();
        });
    }
}
