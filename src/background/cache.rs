use super::BackgroundError;
use crate::core::Image;
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MAGIC: &[u8; 8] = b"PDBGMED1";
const HEADER_LEN: usize = 8 + 8 + 8 + 8;

/// Median image together with the gain it was taken at
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMedian {
    pub gain: i64,
    pub image: Image,
}

/// Outcome of asking the cache for a median at a given gain
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Image),
    Missing,
    GainMismatch { cached_gain: i64 },
}

/// Last-known background median, persisted across runs.
///
/// Holds one entry which is overwritten, never versioned. All file access
/// goes through `lock` so a reader never observes a half-written entry.
pub struct BackgroundMedianCache {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BackgroundMedianCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Per-user location outside any run directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("panel_daq").join("background_median.bin"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, gain: i64) -> Result<CacheLookup, BackgroundError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.read_entry()? {
            None => Ok(CacheLookup::Missing),
            Some(entry) if entry.gain != gain => Ok(CacheLookup::GainMismatch {
                cached_gain: entry.gain,
            }),
            Some(entry) => Ok(CacheLookup::Hit(entry.image)),
        }
    }

    /// The cached median if one exists for exactly `gain`
    pub fn load_last_known(&self, gain: i64) -> Option<Image> {
        match self.lookup(gain) {
            Ok(CacheLookup::Hit(image)) => Some(image),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring unreadable background cache {:?}: {}", self.path, e);
                None
            }
        }
    }

    /// Replace the cached entry (write to a temp file, then rename)
    pub fn persist(&self, image: &Image, gain: i64) -> Result<(), BackgroundError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + image.pixels().len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&gain.to_le_bytes());
        bytes.extend_from_slice(&(image.rows() as u64).to_le_bytes());
        bytes.extend_from_slice(&(image.columns() as u64).to_le_bytes());
        bytes.extend_from_slice(&image.to_le_bytes());

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!("Persisted background median (gain {}) to {:?}", gain, self.path);
        Ok(())
    }

    fn read_entry(&self) -> Result<Option<CachedMedian>, BackgroundError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err(BackgroundError::Corrupt("bad header".to_string()));
        }

        let word = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            buf
        };
        let gain = i64::from_le_bytes(word(8));
        let rows = u64::from_le_bytes(word(16)) as usize;
        let columns = u64::from_le_bytes(word(24)) as usize;

        let image = Image::from_le_bytes(rows, columns, &bytes[HEADER_LEN..])
            .map_err(|e| BackgroundError::Corrupt(e.to_string()))?;

        Ok(Some(CachedMedian { gain, image }))
    }
}
