use crate::error::ClientError;
use crate::session::{ClientConfig, ClientSession};
use log::{debug, error, info};
use shared::{MAX_MSGLEN, PORT_SERVER};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::interval;

/// Client frame length
pub const FRAME_MSEC: u64 = 20;

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    session: ClientSession,
    frames: u64,
}

impl Client {
    pub async fn new(server: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let server_addr = resolve(server).await?;
        let bind = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        info!("Client bound to {}", socket.local_addr()?);

        Ok(Client {
            socket,
            server_addr,
            session: ClientSession::new(config),
            frames: 0,
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession {
        &mut self.session
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    async fn flush(&mut self) -> Result<(), ClientError> {
        for data in self.session.take_outgoing() {
            self.socket.send_to(&data, self.server_addr).await?;
        }
        Ok(())
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if from != self.server_addr {
            debug!("Ignored packet from {}", from);
            return;
        }
        self.session.handle_datagram(data);
    }

    /// Runs frames until `done` holds, the connection ends or `limit` passes
    ///
    /// Returns whether `done` was reached.
    pub async fn run_until<F>(&mut self, limit: Duration, done: F) -> Result<bool, ClientError>
    where
        F: FnMut(&ClientSession) -> bool,
    {
        self.drive(Some(Instant::now() + limit), None, done).await
    }

    async fn drive<F>(
        &mut self,
        deadline: Option<Instant>,
        frame_limit: Option<u64>,
        mut done: F,
    ) -> Result<bool, ClientError>
    where
        F: FnMut(&ClientSession) -> bool,
    {
        let mut frame_interval = interval(Duration::from_millis(FRAME_MSEC));
        let mut last_frame = Instant::now();
        let mut buffer = vec![0u8; MAX_MSGLEN];

        loop {
            if done(&self.session) {
                return Ok(true);
            }
            if self.session.is_disconnected() {
                return Ok(false);
            }
            if frame_limit.is_some_and(|limit| self.frames >= limit) {
                return Ok(false);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ClientError::Timeout);
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buffer[..len], from),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = frame_interval.tick() => {
                    let msec = last_frame.elapsed().as_millis() as u64;
                    last_frame += Duration::from_millis(msec);
                    self.session.frame(msec);
                    self.frames += 1;
                },
            }
            self.flush().await?;
        }
    }

    /// Plays for `frames` frames, or until the server drops the connection
    pub async fn run(&mut self, frames: Option<u64>) -> Result<(), ClientError> {
        info!("Connecting to {}", self.server_addr);
        let limit = frames.map(|f| self.frames + f);
        self.drive(None, limit, |_| false).await?;

        if let Some(e) = self.session.state.error() {
            return Err(e);
        }
        info!(
            "Leaving after {} frames, {} snapshots",
            self.frames,
            self.session.snapshots()
        );
        self.disconnect().await
    }

    /// Sends a final `disconnect` to the server
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.session.disconnect();
        self.flush().await
    }
}

/// Resolves `host[:port]`, defaulting to the standard server port
pub async fn resolve(server: &str) -> Result<SocketAddr, ClientError> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let with_port = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, PORT_SERVER)
    };
    let mut addrs = lookup_host(&with_port)
        .await
        .map_err(|_| ClientError::Resolve(server.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| ClientError::Resolve(server.to_string()))
}
