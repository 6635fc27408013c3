// ============================================================================
// sigrelay Library
// ============================================================================

//! Signal store and notification backbone.
//!
//! Producers push tab-separated status lines over a socket. Lines are
//! decoded and batched into the [`SignalStore`], silent clients are turned
//! into synthetic `Timeout` records, and matching records are announced on
//! HTTP-controlled speaker devices by the [`Dispatcher`], either right away
//! or on a configured re-dispatch schedule.
//!
//! ```no_run
//! use sigrelay::{Backbone, BackboneConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> sigrelay::Result<()> {
//! let config = BackboneConfig::default()
//!     .destination("10.0.0.21\tHall speaker")
//!     .client("Press1\ttrue\t300\tPress1 stopped reporting", "ALL")
//!     .schedule("NG\tEveryHours\t0,30");
//!
//! let backbone = Backbone::start(config).await?;
//! backbone
//!     .bridge()
//!     .submit("2024/01/01 10:00:00.000\tPress1\tNG\tOil pressure low\t\tOnce")
//!     .await?;
//! backbone.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod dispatch;
pub mod ingest;
pub mod liveness;
pub mod registry;
pub mod schedule;
pub mod server;
pub mod service;
pub mod storage;
pub mod web;

// Re-export main types for convenience
pub use config::BackboneConfig;
pub use core::{CheckStyle, MessageRecord, RecordKey, Result, SignalError};
pub use dispatch::{Dispatcher, FailureRecord, PendingNotice};
pub use ingest::{IngestBridge, STORAGE_UNAVAILABLE};
pub use liveness::LivenessMonitor;
pub use registry::{ClientRegistry, DestinationBook};
pub use schedule::{RedispatchJob, ScheduleTable, Scheduler};
pub use service::Backbone;
pub use storage::{SignalStore, StorageStatus};
