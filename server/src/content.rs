//! Content archives the server offers for download and pure validation

use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

/// Checksums a pure client report is compared against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PureChecksums {
    pub cgame: i32,
    pub ui: i32,
    /// Every archive loaded by the server
    pub loaded: Vec<i32>,
}

/// Read-only view of the server's archives
pub trait ContentStore: Send {
    /// Archive names (without `.pk3`) clients are expected to reference
    fn referenced_archives(&self) -> Vec<String>;

    /// Checksum of a referenced archive, in the same order as the names
    fn archive_checksums(&self) -> Vec<i32>;

    /// Official base game archives may never be downloaded
    fn is_official(&self, name: &str) -> bool;

    /// Opens a file for reading and returns it with its size
    fn open(&self, path: &str) -> io::Result<(Box<dyn Read + Send>, u64)>;

    /// `None` when the server has no game code archives to validate against
    fn pure_checksums(&self) -> Option<PureChecksums>;
}

/// 32-bit FNV-1a, used as the archive checksum
pub fn archive_checksum(data: &[u8]) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as i32
}

fn is_official_name(prefixes: &[String], name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    prefixes
        .iter()
        .any(|p| !p.is_empty() && base.to_ascii_lowercase().starts_with(&p.to_ascii_lowercase()))
}

/// Strips `.pk3` (any case) from an archive name
pub fn archive_stem(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    ext.eq_ignore_ascii_case("pk3").then_some(stem)
}

#[derive(Debug, Clone)]
struct Archive {
    name: String,
    checksum: i32,
}

/// Archives found in a directory on disk
///
/// The first two official archives (in name order) are treated as the game
/// code pair every pure client must report.
pub struct DirectoryContent {
    root: PathBuf,
    archives: Vec<Archive>,
    official_prefixes: Vec<String>,
}

impl DirectoryContent {
    pub fn scan(root: &Path, official_prefixes: Vec<String>) -> io::Result<Self> {
        let mut names = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if archive_stem(&file_name).is_some() {
                names.push(file_name);
            }
        }
        names.sort();

        let mut archives = Vec::with_capacity(names.len());
        for file_name in names {
            let data = fs::read(root.join(&file_name))?;
            let checksum = archive_checksum(&data);
            let name = archive_stem(&file_name).unwrap_or(&file_name).to_string();
            info!("Loaded archive {} (checksum {})", name, checksum);
            archives.push(Archive { name, checksum });
        }

        Ok(Self {
            root: root.to_path_buf(),
            archives,
            official_prefixes,
        })
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            warn!("Refusing to open suspicious path {:?}", path);
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "bad path"));
        }
        Ok(self.root.join(relative))
    }
}

impl ContentStore for DirectoryContent {
    fn referenced_archives(&self) -> Vec<String> {
        self.archives.iter().map(|a| a.name.clone()).collect()
    }

    fn archive_checksums(&self) -> Vec<i32> {
        self.archives.iter().map(|a| a.checksum).collect()
    }

    fn is_official(&self, name: &str) -> bool {
        is_official_name(&self.official_prefixes, name)
    }

    fn open(&self, path: &str) -> io::Result<(Box<dyn Read + Send>, u64)> {
        let file = File::open(self.resolve(path)?)?;
        let size = file.metadata()?.len();
        Ok((Box::new(file), size))
    }

    fn pure_checksums(&self) -> Option<PureChecksums> {
        let mut official = self
            .archives
            .iter()
            .filter(|a| is_official_name(&self.official_prefixes, &a.name));
        let cgame = official.next()?.checksum;
        let ui = official.next()?.checksum;
        Some(PureChecksums {
            cgame,
            ui,
            loaded: self.archive_checksums(),
        })
    }
}

/// In-memory archives, for tests and embedded servers
#[derive(Default)]
pub struct MemoryContent {
    files: BTreeMap<String, Vec<u8>>,
    official: HashSet<String>,
    game_code: Option<(String, String)>,
}

impl MemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `<name>.pk3`
    pub fn with_archive(mut self, name: &str, data: Vec<u8>) -> Self {
        self.files.insert(format!("{}.pk3", name), data);
        self
    }

    pub fn with_official(mut self, name: &str, data: Vec<u8>) -> Self {
        self.official.insert(name.to_string());
        self.with_archive(name, data)
    }

    /// Marks two archives as the game code pair for pure validation
    pub fn with_game_code(mut self, cgame: &str, ui: &str) -> Self {
        self.game_code = Some((cgame.to_string(), ui.to_string()));
        self
    }

    fn checksum_of(&self, name: &str) -> Option<i32> {
        self.files
            .get(&format!("{}.pk3", name))
            .map(|d| archive_checksum(d))
    }
}

impl ContentStore for MemoryContent {
    fn referenced_archives(&self) -> Vec<String> {
        self.files
            .keys()
            .filter_map(|k| archive_stem(k).map(str::to_string))
            .collect()
    }

    fn archive_checksums(&self) -> Vec<i32> {
        self.files.values().map(|d| archive_checksum(d)).collect()
    }

    fn is_official(&self, name: &str) -> bool {
        self.official.contains(name)
    }

    fn open(&self, path: &str) -> io::Result<(Box<dyn Read + Send>, u64)> {
        let data = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        let size = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), size))
    }

    fn pure_checksums(&self) -> Option<PureChecksums> {
        let (cgame, ui) = self.game_code.as_ref()?;
        Some(PureChecksums {
            cgame: self.checksum_of(cgame)?,
            ui: self.checksum_of(ui)?,
            loaded: self.archive_checksums(),
        })
    }
}
