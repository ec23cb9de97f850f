//! Server network layer handling UDP communications and the frame loop
//!
//! All protocol state lives in one `ServerContext` owned by `Server::run`.
//! A receiver task forwards datagrams into the loop, the loop feeds them to
//! the context and drains its outbox into a sender task after every event.

use crate::config::ServerConfig;
use crate::context::{Outgoing, ServerContext};
use crate::error::ServerError;
use log::{debug, error, info, warn};
use shared::{AddrKind, NetAddr, MAX_MSGLEN};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Events delivered to the main server loop
#[derive(Debug)]
pub enum ServerEvent {
    Datagram { data: Vec<u8>, addr: SocketAddr },
    /// An operator command line typed on the server console
    Console(String),
    Shutdown,
}

/// Main server coordinating networking and the simulation clock
pub struct Server {
    socket: Arc<UdpSocket>,
    context: ServerContext,
    frame_duration: Duration,

    // Communication channels
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
}

impl Server {
    /// Binds the configured address and builds the context from the config
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let context = ServerContext::from_config(config)?;
        Self::with_context(context).await
    }

    /// Binds the address named in the context's config
    pub async fn with_context(context: ServerContext) -> Result<Self, ServerError> {
        let addr = context.config.bind_address();
        let socket = Arc::new(UdpSocket::bind(&addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            frame_duration: Duration::from_millis(context.config.frame_msec()),
            context,
            event_tx,
            event_rx,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sender for injecting events, used to stop the loop or forward console lines
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerEvent> {
        self.event_tx.clone()
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_MSGLEN];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let event = ServerEvent::Datagram {
                            data: buffer[..len].to_vec(),
                            addr,
                        };
                        if event_tx.send(event).is_err() {
                            debug!("Server loop gone, receiver stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing datagram queue
    fn spawn_network_sender(&mut self) {
        let Some(mut outgoing_rx) = self.outgoing_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            while let Some(packet) = outgoing_rx.recv().await {
                if packet.to.kind != AddrKind::Remote {
                    continue;
                }
                if let Err(e) = socket.send_to(&packet.data, packet.to.addr).await {
                    warn!("Failed to send packet to {}: {}", packet.to, e);
                }
            }
        });
    }

    /// Hands everything the context produced to the sender task
    fn flush(&mut self) {
        for packet in self.context.take_outgoing() {
            if self.outgoing_tx.send(packet).is_err() {
                error!("Sender task stopped, dropping outgoing datagrams");
                break;
            }
        }
    }

    /// Main server loop; returns after a `Shutdown` event
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut frame_interval = interval(self.frame_duration);
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(ServerEvent::Datagram { data, addr }) => {
                            self.context.packet_event(NetAddr::remote(addr), &data);
                        }
                        Some(ServerEvent::Console(line)) => {
                            let output = self.context.execute_operator_command(&line);
                            for line in output.lines() {
                                info!("{}", line);
                            }
                        }
                        Some(ServerEvent::Shutdown) | None => {
                            info!("Server shutting down");
                            self.context.shutdown("Server shutdown");
                            self.flush();
                            break;
                        }
                    }
                },

                _ = frame_interval.tick() => {
                    // Whole milliseconds only; the remainder carries into the next frame
                    let msec = last_frame.elapsed().as_millis() as u64;
                    last_frame += Duration::from_millis(msec);
                    self.context.frame(msec);
                },
            }
            self.flush();
        }

        // Give the sender a moment to push the final disconnects out
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Collaborators;
    use shared::packet::{decode_oob, encode_oob};

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config
    }

    async fn create_test_server() -> Server {
        let context = ServerContext::new(test_config(), Collaborators::in_memory(), 7);
        Server::with_context(context).await.unwrap()
    }

    #[test]
    fn test_server_event_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let event = ServerEvent::Datagram {
            data: encode_oob("getinfo x"),
            addr,
        };

        match event {
            ServerEvent::Datagram { data, addr: a } => {
                assert_eq!(a, addr);
                assert_eq!(decode_oob(&data).as_deref(), Some("getinfo x"));
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[test]
    fn test_server_binds_ephemeral_port() {
        tokio_test::block_on(async {
            let server = create_test_server().await;
            let addr = server.local_addr().unwrap();
            assert_ne!(addr.port(), 0);
            assert_eq!(server.context().map, "arena");
        });
    }

    #[tokio::test]
    async fn test_server_answers_getchallenge_over_udp() {
        let mut server = create_test_server().await;
        let server_addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.run().await });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&encode_oob("getchallenge"), server_addr)
            .await
            .unwrap();

        let mut buffer = [0u8; 1400];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let reply = decode_oob(&buffer[..len]).unwrap();
        assert!(reply.starts_with("challengeResponse "));

        handle.send(ServerEvent::Shutdown).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_console_event_runs_operator_command() {
        let mut server = create_test_server().await;
        let handle = server.handle();
        handle.send(ServerEvent::Console("addbot Sarge".to_string())).unwrap();
        handle.send(ServerEvent::Shutdown).unwrap();

        server.run().await.unwrap();
        // Shutdown drops everyone, the bot slot is freed on drop
        assert_eq!(server.context().clients.bots(), 0);
        assert!(server.context().clients.is_empty());
    }
}
