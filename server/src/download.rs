//! Windowed file transfer multiplexed into a client's message stream
//!
//! Blocks are read lazily into a ring of `MAX_DOWNLOAD_WINDOW` entries. The
//! client acknowledges blocks strictly in order with `nextdl <block>`; the
//! server transmits at most the window beyond the oldest unacknowledged block
//! and rewinds to it when the window has been idle for a second. A zero length
//! block marks the end of the file.

use crate::content::{archive_stem, ContentStore};
use log::{debug, info, warn};
use shared::packet::DownloadBlock;
use shared::{MAX_DOWNLOAD_BLKSIZE, MAX_DOWNLOAD_WINDOW};
use std::io::{self, Read};
use thiserror::Error;

/// Idle time after which the unacknowledged window is sent again
pub const RETRANSMIT_MSEC: u64 = 1000;

/// Why a download request was refused; the text is shown to the client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadRefusal {
    #[error("File \"{0}\" is not referenced and cannot be downloaded.")]
    Unreferenced(String),

    #[error("Cannot autodownload official archive \"{0}\"")]
    Official(String),

    #[error("Could not download \"{0}\" because autodownload is disabled.")]
    Disabled(String),

    #[error("File \"{0}\" not found on server for autodownloading.")]
    NotFound(String),
}

/// Result of a client acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAck {
    /// The window moved forward by one block
    Advanced,
    /// The terminal block was acknowledged and the transfer is over
    Finished,
    /// The client acknowledged a block other than the oldest outstanding one
    OutOfOrder,
}

pub struct DownloadSession {
    name: String,
    reader: Box<dyn Read + Send>,
    size: u64,
    count: u64,
    ring: Vec<Vec<u8>>,
    /// Blocks read from the file so far, the terminal block included
    current_block: u32,
    /// Oldest block the client has not acknowledged
    client_block: u32,
    /// Next block to transmit
    xmit_block: u32,
    eof: bool,
    send_time: u64,
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("current_block", &self.current_block)
            .field("client_block", &self.client_block)
            .field("xmit_block", &self.xmit_block)
            .finish()
    }
}

/// Validates a download request and opens the file
///
/// Only `.pk3` archives the client is expected to reference may be fetched,
/// and official archives never are.
pub fn open_download(
    content: &dyn ContentStore,
    name: &str,
    allow_download: bool,
) -> Result<DownloadSession, DownloadRefusal> {
    let referenced = archive_stem(name)
        .map(|stem| {
            content
                .referenced_archives()
                .iter()
                .any(|r| r.eq_ignore_ascii_case(stem))
        })
        .unwrap_or(false);

    if !referenced {
        return Err(DownloadRefusal::Unreferenced(name.to_string()));
    }
    if archive_stem(name).is_some_and(|stem| content.is_official(stem)) {
        return Err(DownloadRefusal::Official(name.to_string()));
    }
    if !allow_download {
        return Err(DownloadRefusal::Disabled(name.to_string()));
    }

    let (reader, size) = content
        .open(name)
        .map_err(|_| DownloadRefusal::NotFound(name.to_string()))?;
    info!("Starting download of {} ({} bytes)", name, size);
    Ok(DownloadSession::new(name, reader, size))
}

/// Blocks a client may be sent per snapshot at its rate
///
/// The rate is clamped to the server's bounds first; at least one block is
/// always allowed.
pub fn blocks_per_snapshot(rate: u32, snapshot_msec: u64, bounds: (Option<u32>, Option<u32>)) -> usize {
    let (min_rate, max_rate) = bounds;
    let mut rate = rate as u64;
    if let Some(max) = max_rate {
        rate = rate.min(max as u64);
    }
    if let Some(min) = min_rate {
        rate = rate.max(min as u64);
    }
    if rate == 0 {
        return 1;
    }
    let block = MAX_DOWNLOAD_BLKSIZE as u64;
    (((rate * snapshot_msec) / 1000 + block) / block).max(1) as usize
}

impl DownloadSession {
    pub fn new(name: &str, reader: Box<dyn Read + Send>, size: u64) -> Self {
        Self {
            name: name.to_string(),
            reader,
            size,
            count: 0,
            ring: vec![Vec::new(); MAX_DOWNLOAD_WINDOW],
            current_block: 0,
            client_block: 0,
            xmit_block: 0,
            eof: false,
            send_time: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn client_block(&self) -> u32 {
        self.client_block
    }

    pub fn current_block(&self) -> u32 {
        self.current_block
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    fn window_open(&self) -> bool {
        ((self.current_block - self.client_block) as usize) < MAX_DOWNLOAD_WINDOW
    }

    fn slot(block: u32) -> usize {
        block as usize % MAX_DOWNLOAD_WINDOW
    }

    /// Reads ahead until the window is full, then appends the terminal block
    fn fill(&mut self) {
        while self.window_open() && self.count != self.size {
            let mut buf = vec![0u8; MAX_DOWNLOAD_BLKSIZE];
            let n = match read_block(&mut self.reader, &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error on download {}: {}", self.name, e);
                    0
                }
            };
            if n == 0 {
                self.count = self.size;
                break;
            }
            buf.truncate(n);
            self.count += n as u64;
            if n < MAX_DOWNLOAD_BLKSIZE {
                self.count = self.size;
            }
            let index = Self::slot(self.current_block);
            self.ring[index] = buf;
            self.current_block += 1;
        }

        if self.count == self.size && !self.eof && self.window_open() {
            let index = Self::slot(self.current_block);
            self.ring[index] = Vec::new();
            self.current_block += 1;
            self.eof = true;
        }
    }

    /// Blocks to attach to the next message, at most `budget` of them
    pub fn next_blocks(&mut self, now: u64, budget: usize) -> Vec<DownloadBlock> {
        self.fill();

        let mut blocks = Vec::new();
        while blocks.len() < budget.max(1) {
            if self.client_block == self.current_block {
                break;
            }
            if self.xmit_block == self.current_block {
                if now.saturating_sub(self.send_time) > RETRANSMIT_MSEC {
                    debug!(
                        "Download {} resending from block {}",
                        self.name, self.client_block
                    );
                    self.xmit_block = self.client_block;
                } else {
                    break;
                }
            }

            let block = self.xmit_block;
            blocks.push(DownloadBlock {
                block,
                file_size: (block == 0).then_some(self.size),
                data: self.ring[Self::slot(block)].clone(),
            });
            self.xmit_block += 1;
            self.send_time = now;
        }
        blocks
    }

    /// Handles `nextdl <block>`
    pub fn acknowledge(&mut self, block: u32, now: u64) -> BlockAck {
        if block != self.client_block || self.client_block == self.current_block {
            return BlockAck::OutOfOrder;
        }
        if self.ring[Self::slot(block)].is_empty() && self.eof && block + 1 == self.current_block {
            info!("Download {} complete", self.name);
            return BlockAck::Finished;
        }
        self.client_block += 1;
        self.send_time = now;
        BlockAck::Advanced
    }
}

fn read_block(reader: &mut Box<dyn Read + Send>, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
