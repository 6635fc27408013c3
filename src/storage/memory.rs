use super::engine::{ArchiveMonth, ArchiveProvider, MessageCollection};
use crate::core::{MessageRecord, RecordKey, Result, SignalError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Volatile collection, used when no data directory is configured and in tests.
///
/// Writes can be made to fail on demand to exercise storage-failure paths.
#[derive(Default)]
pub struct MemoryCollection {
    records: RwLock<BTreeMap<RecordKey, MessageRecord>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    upsert_calls: AtomicUsize,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following upsert/delete fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of upsert batches received, successful or not.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, key: &RecordKey) -> Option<MessageRecord> {
        self.records.read().await.get(key).cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SignalError::StorageError(
                "memory collection rejected write".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageCollection for MemoryCollection {
    async fn load_all(&self) -> Result<Vec<MessageRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SignalError::StorageError(
                "memory collection rejected read".to_string(),
            ));
        }
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn upsert(&self, records: &[MessageRecord]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;
        let mut stored = self.records.write().await;
        for record in records {
            stored.insert(record.key(), record.clone());
        }
        Ok(())
    }

    async fn delete(&self, keys: &[RecordKey]) -> Result<()> {
        self.check_writable()?;
        let mut stored = self.records.write().await;
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }
}

/// Month collections kept in memory.
#[derive(Default)]
pub struct MemoryArchive {
    months: Mutex<HashMap<ArchiveMonth, Arc<MemoryCollection>>>,
    failing: Mutex<Vec<ArchiveMonth>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes opening the given month fail.
    pub async fn fail_month(&self, month: ArchiveMonth) {
        self.failing.lock().await.push(month);
    }

    pub async fn clear_failures(&self) {
        self.failing.lock().await.clear();
    }

    /// The month's collection if it was ever opened.
    pub async fn existing(&self, month: ArchiveMonth) -> Option<Arc<MemoryCollection>> {
        self.months.lock().await.get(&month).cloned()
    }

    pub async fn months(&self) -> Vec<ArchiveMonth> {
        let mut months: Vec<_> = self.months.lock().await.keys().copied().collect();
        months.sort();
        months
    }
}

#[async_trait]
impl ArchiveProvider for MemoryArchive {
    async fn month(&self, month: ArchiveMonth) -> Result<Arc<dyn MessageCollection>> {
        if self.failing.lock().await.contains(&month) {
            return Err(SignalError::StorageError(format!(
                "archive month {} unavailable",
                month
            )));
        }
        let mut months = self.months.lock().await;
        let collection = months
            .entry(month)
            .or_insert_with(|| Arc::new(MemoryCollection::new()))
            .clone();
        Ok(collection)
    }
}
