//! Notification dispatch to HTTP announcer devices.
//!
//! Each admitted notice runs as its own task through
//! `WaitingToStart -> Sending -> WaitingForDeviceIdle -> Finished`. The
//! dispatcher keeps the running set and per-address failure records in
//! concurrent maps and admits at most one delivery per notice key.

pub mod announcer;
pub mod delivery;
pub mod dispatcher;
pub mod notice;

pub use announcer::{Announcer, HttpAnnouncer, control_query, parse_sound_idle};
pub use delivery::{DeliveryOutcome, DeliveryPhase, DeliverySettings, OutputSwitches};
pub use dispatcher::Dispatcher;
pub use notice::{FailureRecord, NoticeKey, PendingNotice};
