//! Durable checkpoints.
//!
//! `txmin_committed` is the lowest transaction id not yet durably indexed,
//! kept per `(database, index)` pair. Only the sync engine writes it; the
//! replication reader observes it through a read-only snapshot to decide
//! when the slot may advance.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BrokerError;

/// Sanitized storage key for a `(database, index)` pair. Keys that would
/// not make a reasonable file name are hashed.
pub fn checkpoint_key(database: &str, index: &str) -> String {
    let raw = format!("{database}_{index}");
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if sanitized.len() > 64 {
        format!("{:x}", md5::compute(raw.as_bytes()))
    } else {
        sanitized
    }
}

/// Storage seam for checkpoints. The file store ships in-tree; a broker
/// backend implements the same contract.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<u64>, BrokerError>;
    fn save(&self, key: &str, value: u64) -> Result<(), BrokerError>;
}

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.checkpoint"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<u64>, BrokerError> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(raw) => {
                let value = raw.trim().parse::<u64>().map_err(|e| {
                    BrokerError::Unavailable(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("corrupt checkpoint {key}: {e}"),
                    ))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BrokerError::Unavailable(e)),
        }
    }

    fn save(&self, key: &str, value: u64) -> Result<(), BrokerError> {
        std::fs::create_dir_all(&self.dir).map_err(BrokerError::Unavailable)?;
        // Write-then-rename so a crash never leaves a torn checkpoint.
        let tmp = self.dir.join(format!(".{key}.checkpoint.tmp"));
        std::fs::write(&tmp, format!("{value}\n")).map_err(BrokerError::Unavailable)?;
        std::fs::rename(&tmp, self.path(key)).map_err(BrokerError::Unavailable)?;
        Ok(())
    }
}

/// Read-only view of the committed checkpoint, safe to hand to other
/// workers.
#[derive(Clone)]
pub struct CheckpointSnapshot(Arc<AtomicU64>);

impl CheckpointSnapshot {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Checkpoint {
    key: String,
    store: Box<dyn CheckpointStore>,
    value: Arc<AtomicU64>,
}

impl Checkpoint {
    pub fn open(
        store: Box<dyn CheckpointStore>,
        database: &str,
        index: &str,
    ) -> Result<Self, BrokerError> {
        let key = checkpoint_key(database, index);
        let value = store.load(&key)?.unwrap_or(0);
        Ok(Self {
            key,
            store,
            value: Arc::new(AtomicU64::new(value)),
        })
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Persist a new checkpoint. Regressions are ignored; the checkpoint
    /// is monotonically non-decreasing. Returns whether it moved.
    pub fn advance(&self, txid: u64) -> Result<bool, BrokerError> {
        if txid <= self.get() {
            return Ok(false);
        }
        self.store.save(&self.key, txid)?;
        self.value.store(txid, Ordering::Release);
        Ok(true)
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        CheckpointSnapshot(Arc::clone(&self.value))
    }
}

/// Backfill position for parallel sync: the next heap block to process,
/// one `<database>_<index>.ctid` file per run.
pub struct CtidCheckpoint {
    path: PathBuf,
}

impl CtidCheckpoint {
    pub fn new(dir: impl Into<PathBuf>, database: &str, index: &str) -> Self {
        let dir: PathBuf = dir.into();
        Self {
            path: dir.join(format!("{}.ctid", checkpoint_key(database, index))),
        }
    }

    pub fn load(&self) -> Result<Option<u64>, BrokerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| {
                    BrokerError::Unavailable(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        e.to_string(),
                    ))
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BrokerError::Unavailable(e)),
        }
    }

    pub fn save(&self, next_block: u64) -> Result<(), BrokerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(BrokerError::Unavailable)?;
        }
        std::fs::write(&self.path, format!("{next_block}\n")).map_err(BrokerError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_key_sanitizes() {
        assert_eq!(checkpoint_key("books", "books"), "books_books");
        assert_eq!(checkpoint_key("my-db", "my.index"), "my_db_my_index");
    }

    #[test]
    fn test_checkpoint_key_hashes_long_names() {
        let long = "x".repeat(80);
        let key = checkpoint_key(&long, "idx");
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.load("books_books").unwrap(), None);
        store.save("books_books", 42).unwrap();
        assert_eq!(store.load("books_books").unwrap(), Some(42));
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = Box::new(FileCheckpointStore::new(dir.path()));
        let checkpoint = Checkpoint::open(store, "books", "books").unwrap();

        assert!(checkpoint.advance(10).unwrap());
        assert!(!checkpoint.advance(5).unwrap());
        assert!(!checkpoint.advance(10).unwrap());
        assert_eq!(checkpoint.get(), 10);
        assert!(checkpoint.advance(11).unwrap());

        // A fresh open sees the persisted value.
        let reopened = Checkpoint::open(
            Box::new(FileCheckpointStore::new(dir.path())),
            "books",
            "books",
        )
        .unwrap();
        assert_eq!(reopened.get(), 11);
    }

    #[test]
    fn test_snapshot_tracks_engine_writes() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(
            Box::new(FileCheckpointStore::new(dir.path())),
            "books",
            "books",
        )
        .unwrap();
        let snapshot = checkpoint.snapshot();
        assert_eq!(snapshot.get(), 0);
        checkpoint.advance(7).unwrap();
        assert_eq!(snapshot.get(), 7);
    }

    #[test]
    fn test_ctid_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctid = CtidCheckpoint::new(dir.path(), "books", "books");
        assert_eq!(ctid.load().unwrap(), None);
        ctid.save(320).unwrap();
        assert_eq!(ctid.load().unwrap(), Some(320));
    }
}
