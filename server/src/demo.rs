//! Server side demo recording of one client's message stream
//!
//! A demo file is a sequence of `sequence: i32 LE`, `length: i32 LE` and
//! `length` bytes of datagram, closed by a `-1, -1` trailer. The first record
//! is the gamestate the client would need to play the recording back.

use log::info;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const DEMO_EXTENSION: &str = "dm_68";

/// `<slot>_<name>_<time>.dm_68`, keeping only alphanumeric name characters
pub fn demo_file_name(slot: usize, name: &str, time: u64) -> String {
    let clean: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("{}_{}_{}.{}", slot, clean, time, DEMO_EXTENSION)
}

pub struct DemoRecorder {
    path: PathBuf,
    out: BufWriter<File>,
    messages: usize,
}

impl std::fmt::Debug for DemoRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoRecorder")
            .field("path", &self.path)
            .field("messages", &self.messages)
            .finish()
    }
}

impl DemoRecorder {
    /// Creates the file and writes the gamestate header record
    pub fn start(
        dir: &Path,
        file_name: &str,
        header_sequence: i32,
        header: &[u8],
    ) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        let out = BufWriter::new(File::create(&path)?);
        let mut recorder = Self {
            path,
            out,
            messages: 0,
        };
        recorder.write_message(header_sequence, header)?;
        info!("Recording demo {}", recorder.path.display());
        Ok(recorder)
    }

    pub fn write_message(&mut self, sequence: i32, data: &[u8]) -> io::Result<()> {
        self.out.write_all(&sequence.to_le_bytes())?;
        self.out.write_all(&(data.len() as i32).to_le_bytes())?;
        self.out.write_all(data)?;
        self.messages += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn messages(&self) -> usize {
        self.messages
    }

    /// Writes the trailer and closes the file
    pub fn stop(mut self) -> io::Result<PathBuf> {
        self.out.write_all(&(-1i32).to_le_bytes())?;
        self.out.write_all(&(-1i32).to_le_bytes())?;
        self.out.flush()?;
        info!(
            "Stopped demo {} after {} messages",
            self.path.display(),
            self.messages
        );
        Ok(self.path)
    }
}

/// Reads every record of a finished demo
pub fn read_demo(path: &Path) -> io::Result<Vec<(i32, Vec<u8>)>> {
    let mut file = File::open(path)?;
    let mut records = Vec::new();
    let mut word = [0u8; 4];
    loop {
        file.read_exact(&mut word)?;
        let sequence = i32::from_le_bytes(word);
        file.read_exact(&mut word)?;
        let len = i32::from_le_bytes(word);
        if sequence == -1 && len == -1 {
            return Ok(records);
        }
        if len < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "negative length"));
        }
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        records.push((sequence, data));
    }
}
