use crate::sequence::{Sequence, SequenceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Layout version written to store and export files.
pub const FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct VersionedFile<'a> {
    version: u32,
    sequences: &'a [Sequence],
}

/// Versioned envelope, or the older bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SequenceFile {
    Bare(Vec<Sequence>),
    Versioned {
        #[serde(default)]
        version: u32,
        sequences: Vec<Sequence>,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed sequence file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence for sequence definitions.
pub trait SequenceStore: Send + Sync {
    fn find(&self, id: SequenceId) -> Result<Option<Sequence>, StoreError>;

    /// All sequences, by `order` then id.
    fn list(&self) -> Result<Vec<Sequence>, StoreError>;

    /// Inserts or replaces. A sequence without id gets the next free one.
    fn save(&self, sequence: Sequence) -> Result<SequenceId, StoreError>;

    /// `Ok(false)` when nothing had that id.
    fn delete(&self, id: SequenceId) -> Result<bool, StoreError>;
}

fn sort_for_display(sequences: &mut [Sequence]) {
    sequences.sort_by_key(|s| (s.order.unwrap_or(i32::MAX), s.id.unwrap_or(SequenceId::MAX)));
}

fn upsert(sequences: &mut BTreeMap<SequenceId, Sequence>, mut sequence: Sequence) -> SequenceId {
    let id = match sequence.id {
        Some(id) => id,
        None => sequences.keys().next_back().map_or(1, |last| last + 1),
    };
    sequence.id = Some(id);
    sequences.insert(id, sequence);
    id
}

/// Entries with an explicit id are placed first, so an id-less entry never
/// takes an id that appears later in the input.
fn index_by_id(sequences: impl IntoIterator<Item = Sequence>) -> BTreeMap<SequenceId, Sequence> {
    let (explicit, implicit): (Vec<Sequence>, Vec<Sequence>) = sequences.into_iter().partition(|s| s.id.is_some());
    let mut map: BTreeMap<SequenceId, Sequence> = BTreeMap::new();
    for sequence in explicit {
        if let Some(previous) = sequence.id.and_then(|id| map.get(&id)) {
            log::warn!("Duplicate sequence id, '{}' replaces '{}'", sequence.name, previous.name);
        }
        upsert(&mut map, sequence);
    }
    for sequence in implicit {
        upsert(&mut map, sequence);
    }
    map
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    sequences: RwLock<BTreeMap<SequenceId, Sequence>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequences(sequences: impl IntoIterator<Item = Sequence>) -> Self {
        Self {
            sequences: RwLock::new(index_by_id(sequences)),
        }
    }
}

impl SequenceStore for MemoryStore {
    fn find(&self, id: SequenceId) -> Result<Option<Sequence>, StoreError> {
        let map = self.sequences.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<Sequence>, StoreError> {
        let map = self.sequences.read().unwrap_or_else(PoisonError::into_inner);
        let mut sequences: Vec<Sequence> = map.values().cloned().collect();
        sort_for_display(&mut sequences);
        Ok(sequences)
    }

    fn save(&self, sequence: Sequence) -> Result<SequenceId, StoreError> {
        let mut map = self.sequences.write().unwrap_or_else(PoisonError::into_inner);
        Ok(upsert(&mut map, sequence))
    }

    fn delete(&self, id: SequenceId) -> Result<bool, StoreError> {
        let mut map = self.sequences.write().unwrap_or_else(PoisonError::into_inner);
        Ok(map.remove(&id).is_some())
    }
}

/// Sequences kept as one JSON file, in the same layout as exports.
///
/// Every call re-reads the file, so edits by other processes are picked up.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<SequenceId, Sequence>, StoreError> {
        let sequences = match read_sequences(&self.path) {
            Ok(sequences) => sequences,
            Err(StoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(index_by_id(sequences))
    }

    fn persist(&self, map: &BTreeMap<SequenceId, Sequence>) -> Result<(), StoreError> {
        let sequences: Vec<Sequence> = map.values().cloned().collect();
        write_sequences(&self.path, &sequences)
    }
}

impl SequenceStore for JsonFileStore {
    fn find(&self, id: SequenceId) -> Result<Option<Sequence>, StoreError> {
        Ok(self.load()?.remove(&id))
    }

    fn list(&self) -> Result<Vec<Sequence>, StoreError> {
        let mut sequences: Vec<Sequence> = self.load()?.into_values().collect();
        sort_for_display(&mut sequences);
        Ok(sequences)
    }

    fn save(&self, sequence: Sequence) -> Result<SequenceId, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load()?;
        let id = upsert(&mut map, sequence);
        self.persist(&map)?;
        log::debug!("Saved sequence {} to {}", id, self.path.display());
        Ok(id)
    }

    fn delete(&self, id: SequenceId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load()?;
        if map.remove(&id).is_none() {
            return Ok(false);
        }
        self.persist(&map)?;
        Ok(true)
    }
}

fn read_sequences(path: &Path) -> Result<Vec<Sequence>, StoreError> {
    let data = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: SequenceFile = serde_json::from_slice(&data).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    match file {
        SequenceFile::Bare(sequences) => Ok(sequences),
        SequenceFile::Versioned { version, sequences } => {
            if version > FILE_VERSION {
                log::warn!("{} has layout version {}, newer than {}", path.display(), version, FILE_VERSION);
            }
            Ok(sequences)
        }
    }
}

fn write_sequences(path: &Path, sequences: &[Sequence]) -> Result<(), StoreError> {
    write_json_atomic(
        path,
        &VersionedFile {
            version: FILE_VERSION,
            sequences,
        },
    )
}

fn write_json_atomic<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data).map_err(io_error)?;
    std::fs::rename(&tmp, path).map_err(io_error)
}

/// Writes every stored sequence to `path`; returns how many.
pub fn export_sequences(store: &dyn SequenceStore, path: &Path) -> Result<usize, StoreError> {
    let sequences = store.list()?;
    write_sequences(path, &sequences)?;
    Ok(sequences.len())
}

/// Adds the sequences of an export file as new entries; returns how many.
/// Accepts the versioned layout and a bare array.
pub fn import_sequences(store: &dyn SequenceStore, path: &Path) -> Result<usize, StoreError> {
    let sequences = read_sequences(path)?;
    let count = sequences.len();
    for mut sequence in sequences {
        sequence.id = None;
        store.save(sequence)?;
    }
    Ok(count)
}
