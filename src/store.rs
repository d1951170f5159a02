//! Durable, keyed-by-port storage for [`DroneState`] snapshots.
//!
//! Grounded on `persistent_queue::PersistentQueue`'s file framing (magic
//! header + length-prefixed, checksummed records), adapted from an
//! append-only replay log to a keyed-by-port snapshot file: every
//! `save_all` rewrites the whole file from the in-memory map, since state
//! records are small, mutate frequently, and only the latest value per port
//! matters (unlike the teacher's queue, which must preserve every message).
//! Serialization uses `serde_json` rather than the teacher's `bincode`,
//! since this crate does not carry a `bincode` dependency (see DESIGN.md).

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::{error, warn};

use crate::error::PersistError;
use crate::state::DroneState;

const MAGIC: &[u8; 8] = b"DRWATCH1";

/// Durable state storage keyed by listening port.
pub trait Store: Send + Sync {
    fn save(&self, state: &DroneState) -> Result<(), PersistError>;
    fn save_all(&self, states: &[DroneState]) -> Result<(), PersistError>;
    fn find_by_port(&self, port: u16) -> Result<Option<DroneState>, PersistError>;
    fn find_by_gcs_ip(&self, gcs_ip: &str) -> Result<Vec<DroneState>, PersistError>;
    fn delete_by_port(&self, port: u16) -> Result<(), PersistError>;
}

/// File-backed [`Store`] implementation: one record per port, each framed
/// as `[u32 len][json bytes][u32 crc32]`, preceded by an 8-byte magic
/// header. The whole file is read into memory on open and rewritten
/// wholesale on every mutating call.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<HashMap<u16, DroneState>, PersistError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        if reader.read_exact(&mut magic).is_err() {
            return Ok(HashMap::new());
        }
        if &magic != MAGIC {
            return Err(PersistError::Corrupt(format!(
                "bad magic header in {}",
                self.path.display()
            )));
        }

        let mut states = HashMap::new();
        loop {
            let mut len_bytes = [0u8; 4];
            if reader.read_exact(&mut len_bytes).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;

            let mut data = vec![0u8; len];
            reader.read_exact(&mut data)?;

            let mut checksum_bytes = [0u8; 4];
            reader.read_exact(&mut checksum_bytes)?;
            let expected = u32::from_le_bytes(checksum_bytes);

            let mut hasher = Hasher::new();
            hasher.update(&data);
            if hasher.finalize() != expected {
                error!(path = %self.path.display(), "checksum mismatch, skipping corrupt record");
                continue;
            }

            match serde_json::from_slice::<DroneState>(&data) {
                Ok(state) => {
                    states.insert(state.port, state);
                }
                Err(err) => {
                    warn!(%err, "failed to deserialize state record, skipping");
                }
            }
        }

        Ok(states)
    }

    fn persist(&self, states: &HashMap<u16, DroneState>) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        let file = std::fs::File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC)?;
        for state in states.values() {
            let data = serde_json::to_vec(state)?;
            let mut hasher = Hasher::new();
            hasher.update(&data);
            let checksum = hasher.finalize();

            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(&data)?;
            writer.write_all(&checksum.to_le_bytes())?;
        }
        writer.flush()?;
        drop(writer);

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

impl Store for FileStateStore {
    fn save(&self, state: &DroneState) -> Result<(), PersistError> {
        let mut states = self.load()?;
        states.insert(state.port, state.clone());
        self.persist(&states)
    }

    fn save_all(&self, states: &[DroneState]) -> Result<(), PersistError> {
        let mut existing = self.load()?;
        for state in states {
            existing.insert(state.port, state.clone());
        }
        self.persist(&existing)
    }

    fn find_by_port(&self, port: u16) -> Result<Option<DroneState>, PersistError> {
        Ok(self.load()?.remove(&port))
    }

    fn find_by_gcs_ip(&self, gcs_ip: &str) -> Result<Vec<DroneState>, PersistError> {
        Ok(self
            .load()?
            .into_values()
            .filter(|state| state.gcs_ip == gcs_ip)
            .collect())
    }

    fn delete_by_port(&self, port: u16) -> Result<(), PersistError> {
        let mut states = self.load()?;
        states.remove(&port);
        self.persist(&states)
    }
}
