//! Write-ahead journal and snapshot files backing a message collection.

use super::engine::{ArchiveMonth, ArchiveProvider, MessageCollection};
use crate::core::{MessageRecord, RecordKey, Result, SignalError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{Level, event};

const JOURNAL_FILE: &str = "messages.journal";
const SNAPSHOT_FILE: &str = "messages.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Journal Entry Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalEntry {
    Upsert(Vec<MessageRecord>),
    Delete(Vec<RecordKey>),
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionSnapshot {
    version: u32,
    records: Vec<MessageRecord>,
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every journal append.
    #[default]
    Sync,
    /// Flush to the OS only.
    Async,
}

// ============================================================================
// File Collection
// ============================================================================

struct JournalState {
    entries_since_checkpoint: usize,
}

#[derive(Default)]
struct JournalContents {
    entries: Vec<JournalEntry>,
    valid_len: usize,
    torn_bytes: usize,
}

/// A collection stored as a length-prefixed MessagePack journal plus a
/// compacted snapshot inside one directory.
pub struct FileCollection {
    dir: PathBuf,
    durability_mode: DurabilityMode,
    checkpoint_threshold: usize,
    state: Mutex<JournalState>,
}

impl FileCollection {
    /// Opens (creating if needed) the collection stored in `dir`.
    pub async fn open<P: AsRef<Path>>(
        dir: P,
        durability_mode: DurabilityMode,
        checkpoint_threshold: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            SignalError::StorageError(format!(
                "Failed to create collection directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let collection = Self {
            dir,
            durability_mode,
            checkpoint_threshold: checkpoint_threshold.max(1),
            state: Mutex::new(JournalState {
                entries_since_checkpoint: 0,
            }),
        };
        let journal = collection.read_journal().await?;
        if journal.torn_bytes > 0 {
            collection.truncate_journal(journal.valid_len).await?;
        }
        collection.state.lock().await.entries_since_checkpoint = journal.entries.len();
        Ok(collection)
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub async fn entries_since_checkpoint(&self) -> usize {
        self.state.lock().await.entries_since_checkpoint
    }

    async fn append(&self, state: &mut JournalState, entry: &JournalEntry) -> Result<()> {
        let serialized = rmp_serde::to_vec(entry).map_err(|e| {
            SignalError::StorageError(format!("Failed to serialize journal entry: {}", e))
        })?;
        let len = serialized.len() as u32;
        let mut frame = Vec::with_capacity(serialized.len() + 4);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&serialized);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to open journal: {}", e)))?;
        file.write_all(&frame)
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to write journal: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to flush journal: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.sync_data()
                .await
                .map_err(|e| SignalError::StorageError(format!("Failed to sync journal: {}", e)))?;
        }

        state.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Cuts an incomplete trailing frame so later appends start on a frame
    /// boundary.
    async fn truncate_journal(&self, valid_len: usize) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.journal_path())
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to open journal: {}", e)))?;
        file.set_len(valid_len as u64).await.map_err(|e| {
            SignalError::StorageError(format!("Failed to truncate journal tail: {}", e))
        })?;
        file.sync_all()
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to sync journal: {}", e)))?;
        event!(
            Level::WARN,
            journal = %self.journal_path().display(),
            valid_len,
            "truncated incomplete journal tail"
        );
        Ok(())
    }

    async fn read_journal(&self) -> Result<JournalContents> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(JournalContents::default());
        }
        let data = fs::read(&path)
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to read journal: {}", e)))?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= data.len() {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&data[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let start = offset + 4;
            if start + len > data.len() {
                break;
            }
            let entry: JournalEntry =
                rmp_serde::from_slice(&data[start..start + len]).map_err(|e| {
                    SignalError::StorageError(format!("Failed to deserialize journal entry: {}", e))
                })?;
            entries.push(entry);
            offset = start + len;
        }

        if offset != data.len() {
            // A torn tail is what a crash mid-append leaves behind.
            event!(
                Level::WARN,
                journal = %path.display(),
                trailing_bytes = data.len() - offset,
                "ignoring incomplete journal tail"
            );
        }
        Ok(JournalContents {
            entries,
            valid_len: offset,
            torn_bytes: data.len() - offset,
        })
    }

    async fn read_snapshot(&self) -> Result<Vec<MessageRecord>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path)
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: CollectionSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            SignalError::StorageError(format!("Failed to deserialize snapshot: {}", e))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SignalError::StorageError(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot.records)
    }

    async fn materialize(&self) -> Result<BTreeMap<RecordKey, MessageRecord>> {
        let mut records: BTreeMap<RecordKey, MessageRecord> = self
            .read_snapshot()
            .await?
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();

        for entry in self.read_journal().await?.entries {
            match entry {
                JournalEntry::Upsert(batch) => {
                    for record in batch {
                        records.insert(record.key(), record);
                    }
                }
                JournalEntry::Delete(keys) => {
                    for key in keys {
                        records.remove(&key);
                    }
                }
            }
        }
        Ok(records)
    }

    /// Folds the journal into a fresh snapshot and truncates the journal.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.checkpoint_locked(&mut state).await
    }

    async fn checkpoint_locked(&self, state: &mut JournalState) -> Result<()> {
        let records: Vec<MessageRecord> = self.materialize().await?.into_values().collect();
        let snapshot = CollectionSnapshot {
            version: SNAPSHOT_VERSION,
            records,
        };
        let serialized = rmp_serde::to_vec(&snapshot).map_err(|e| {
            SignalError::StorageError(format!("Failed to serialize snapshot: {}", e))
        })?;

        let dir = self.dir.clone();
        let target = self.snapshot_path();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &serialized))
            .await
            .map_err(|e| SignalError::StorageError(format!("snapshot writer join: {}", e)))??;

        fs::write(self.journal_path(), b"")
            .await
            .map_err(|e| SignalError::StorageError(format!("Failed to truncate journal: {}", e)))?;
        state.entries_since_checkpoint = 0;
        Ok(())
    }

    async fn maybe_checkpoint(&self, state: &mut JournalState) {
        if state.entries_since_checkpoint < self.checkpoint_threshold {
            return;
        }
        if let Err(err) = self.checkpoint_locked(state).await {
            // The journal still holds everything; compaction retries next time.
            event!(Level::WARN, dir = %self.dir.display(), error = %err, "collection checkpoint failed");
        }
    }
}

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SignalError::StorageError(format!("Failed to create temp file: {}", e)))?;
    temp.write_all(bytes)
        .map_err(|e| SignalError::StorageError(format!("Failed to write snapshot: {}", e)))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| SignalError::StorageError(format!("Failed to sync snapshot: {}", e)))?;
    temp.persist(target)
        .map_err(|e| SignalError::StorageError(format!("Failed to rename snapshot: {}", e)))?;
    Ok(())
}

#[async_trait]
impl MessageCollection for FileCollection {
    async fn load_all(&self) -> Result<Vec<MessageRecord>> {
        let _state = self.state.lock().await;
        Ok(self.materialize().await?.into_values().collect())
    }

    async fn upsert(&self, records: &[MessageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        self.append(&mut state, &JournalEntry::Upsert(records.to_vec()))
            .await?;
        self.maybe_checkpoint(&mut state).await;
        Ok(())
    }

    async fn delete(&self, keys: &[RecordKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        self.append(&mut state, &JournalEntry::Delete(keys.to_vec()))
            .await?;
        self.maybe_checkpoint(&mut state).await;
        Ok(())
    }
}

// ============================================================================
// File Archive
// ============================================================================

/// Month collections under `{root}/{yyyy}/{yyyyMM}`.
pub struct FileArchive {
    root: PathBuf,
    durability_mode: DurabilityMode,
    checkpoint_threshold: usize,
    opened: Mutex<HashMap<ArchiveMonth, Arc<FileCollection>>>,
}

impl FileArchive {
    pub fn new<P: AsRef<Path>>(
        root: P,
        durability_mode: DurabilityMode,
        checkpoint_threshold: usize,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            durability_mode,
            checkpoint_threshold,
            opened: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ArchiveProvider for FileArchive {
    async fn month(&self, month: ArchiveMonth) -> Result<Arc<dyn MessageCollection>> {
        let mut opened = self.opened.lock().await;
        if let Some(existing) = opened.get(&month) {
            return Ok(existing.clone());
        }
        let collection = Arc::new(
            FileCollection::open(
                self.root.join(month.relative_path()),
                self.durability_mode,
                self.checkpoint_threshold,
            )
            .await?,
        );
        opened.insert(month, collection.clone());
        Ok(collection)
    }
}
