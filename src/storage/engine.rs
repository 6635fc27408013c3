use crate::core::{MessageRecord, RecordKey, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A durable collection of message records keyed by [`RecordKey`].
///
/// Implementations give upsert semantics: writing a record whose key is
/// already stored replaces it.
#[async_trait]
pub trait MessageCollection: Send + Sync {
    /// Reads every stored record.
    async fn load_all(&self) -> Result<Vec<MessageRecord>>;

    /// Inserts or replaces the given records.
    async fn upsert(&self, records: &[MessageRecord]) -> Result<()>;

    /// Removes the records with the given keys; unknown keys are ignored.
    async fn delete(&self, keys: &[RecordKey]) -> Result<()>;
}

/// Calendar month naming one cold archive unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveMonth {
    pub year: i32,
    pub month: u32,
}

impl ArchiveMonth {
    pub fn of(time: &NaiveDateTime) -> Self {
        Self {
            year: time.year(),
            month: time.month(),
        }
    }

    /// First instant of the month.
    pub fn start(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
    }

    /// Relative location of the unit: `{yyyy}/{yyyyMM}`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!("{:04}", self.year)).join(format!("{:04}{:02}", self.year, self.month))
    }
}

impl fmt::Display for ArchiveMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

/// Hands out the cold collection of a month, creating it on first use.
#[async_trait]
pub trait ArchiveProvider: Send + Sync {
    async fn month(&self, month: ArchiveMonth) -> Result<Arc<dyn MessageCollection>>;
}
