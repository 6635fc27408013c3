//! Signal store: the hot in-memory index, its durable collection and the
//! month archives records are swept into.

pub mod archive;
pub mod engine;
pub mod memory;
pub mod persistence;
pub mod store;

pub use archive::{SweepReport, plan_sweep};
pub use engine::{ArchiveMonth, ArchiveProvider, MessageCollection};
pub use memory::{MemoryArchive, MemoryCollection};
pub use persistence::{DurabilityMode, FileArchive, FileCollection};
pub use store::{SignalStore, StorageStatus, StoreStats};
