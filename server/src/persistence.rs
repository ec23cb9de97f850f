//! Player positions saved across connections
//!
//! Records are keyed by map and client GUID and stored as plain
//! `x,y,z,pitch,yaw,roll` text.

use log::debug;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SavedPosition {
    pub origin: [f32; 3],
    pub angles: [f32; 3],
}

impl SavedPosition {
    pub fn is_zero(&self) -> bool {
        self.origin == [0.0; 3] && self.angles == [0.0; 3]
    }

    pub fn encode(&self) -> String {
        let [x, y, z] = self.origin;
        let [a, b, c] = self.angles;
        format!("{},{},{},{},{},{}", x, y, z, a, b, c)
    }

    pub fn decode(text: &str) -> Result<Self, StoreError> {
        let values = text
            .trim()
            .split(',')
            .map(|v| v.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StoreError::Malformed(text.to_string()))?;

        match values[..] {
            [x, y, z, a, b, c] => Ok(Self {
                origin: [x, y, z],
                angles: [a, b, c],
            }),
            _ => Err(StoreError::Malformed(text.to_string())),
        }
    }
}

pub trait PlayerStore: Send {
    fn load(&self, map: &str, guid: &str) -> Result<Option<SavedPosition>, StoreError>;
    fn save(&mut self, map: &str, guid: &str, position: &SavedPosition) -> Result<(), StoreError>;
}

/// Records under `<root>/positions/<map>/<guid>.pos`
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, map: &str, guid: &str) -> Result<PathBuf, StoreError> {
        for part in [map, guid] {
            if part.is_empty() || part.contains(['/', '\\']) || part.contains("..") {
                return Err(StoreError::Malformed(format!("bad key {:?}", part)));
            }
        }
        Ok(self
            .root
            .join("positions")
            .join(map)
            .join(format!("{}.pos", guid)))
    }
}

impl PlayerStore for FileStore {
    fn load(&self, map: &str, guid: &str) -> Result<Option<SavedPosition>, StoreError> {
        let path = self.path(map, guid)?;
        match fs::read_to_string(&path) {
            Ok(text) => SavedPosition::decode(&text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, map: &str, guid: &str, position: &SavedPosition) -> Result<(), StoreError> {
        let path = self.path(map, guid)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, position.encode())?;
        debug!("Saved position to {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<(String, String), String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlayerStore for MemoryStore {
    fn load(&self, map: &str, guid: &str) -> Result<Option<SavedPosition>, StoreError> {
        self.records
            .get(&(map.to_string(), guid.to_string()))
            .map(|text| SavedPosition::decode(text))
            .transpose()
    }

    fn save(&mut self, map: &str, guid: &str, position: &SavedPosition) -> Result<(), StoreError> {
        self.records
            .insert((map.to_string(), guid.to_string()), position.encode());
        Ok(())
    }
}
