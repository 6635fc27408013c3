//! Periodic re-dispatch of unacknowledged records.

pub mod trigger;

pub use trigger::{ScheduleEntry, ScheduleTable, Trigger};

use crate::core::{CheckStyle, MessageRecord, local_now};
use crate::dispatch::{Dispatcher, PendingNotice};
use crate::registry::ClientRegistry;
use crate::storage::SignalStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// What one firing did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RedispatchReport {
    /// Notices the dispatcher accepted.
    pub notices_enqueued: usize,
    /// `Once` records marked acknowledged.
    pub finalized: usize,
}

/// Re-scans the store for a status and routes the newest unacknowledged
/// record of every registered client to the dispatcher.
pub struct RedispatchJob {
    store: SignalStore,
    dispatcher: Dispatcher,
    registry: ClientRegistry,
    empty_name_warned: AtomicBool,
}

impl RedispatchJob {
    pub fn new(store: SignalStore, dispatcher: Dispatcher, registry: ClientRegistry) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            empty_name_warned: AtomicBool::new(false),
        }
    }

    pub async fn run_once(&self, target_status: &str) -> RedispatchReport {
        let mut report = RedispatchReport::default();
        let unacked = self
            .store
            .select(|r| r.status == target_status && !r.acknowledged)
            .await;
        if unacked.is_empty() {
            return report;
        }

        let nameless = unacked.iter().filter(|r| r.client_name.is_empty()).count();
        if nameless > 0 {
            if !self.empty_name_warned.swap(true, Ordering::Relaxed) {
                event!(Level::WARN, records = nameless, "unacknowledged records without a client name");
            }
        } else {
            self.empty_name_warned.store(false, Ordering::Relaxed);
        }

        let mut latest: HashMap<&str, &MessageRecord> = HashMap::new();
        for record in unacked.iter().filter(|r| !r.client_name.is_empty()) {
            latest
                .entry(record.client_name.as_str())
                .and_modify(|current| {
                    if record.connect_time > current.connect_time {
                        *current = record;
                    }
                })
                .or_insert(record);
        }

        let mut finalize = Vec::new();
        for client in self.registry.clients() {
            if let Some(record) = latest.get(client.name()) {
                for destination in client.destinations() {
                    if self
                        .dispatcher
                        .enqueue(PendingNotice::for_record(&destination.address, record))
                    {
                        report.notices_enqueued += 1;
                    }
                }
            }

            // Hand-off is what finalizes a Once record, whatever the delivery does.
            finalize.extend(
                unacked
                    .iter()
                    .filter(|r| r.client_name == client.name() && r.check_style == CheckStyle::Once)
                    .map(|r| r.clone().acknowledged(true)),
            );
        }

        for record in finalize {
            let key = record.key();
            match self.store.save(record) {
                Ok(()) => report.finalized += 1,
                Err(err) => {
                    event!(Level::ERROR, key = %key, error = %err, "failed to acknowledge record")
                }
            }
        }
        if report.finalized > 0 {
            if let Err(err) = self.store.flush().await {
                event!(Level::WARN, error = %err, "store flush after acknowledging failed");
            }
        }

        event!(
            Level::INFO,
            status = %target_status,
            notices = report.notices_enqueued,
            finalized = report.finalized,
            "re-dispatch finished"
        );
        report
    }
}

/// The configured schedule and the job it drives.
pub struct Scheduler {
    table: ScheduleTable,
    job: Arc<RedispatchJob>,
}

impl Scheduler {
    pub fn new(table: ScheduleTable, job: RedispatchJob) -> Self {
        for error in &table.errors {
            event!(Level::WARN, error = %error, "schedule entry rejected");
        }
        Self {
            table,
            job: Arc::new(job),
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.table.entries
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.table.descriptions()
    }

    pub fn job(&self) -> &RedispatchJob {
        &self.job
    }

    /// Starts one timer task per entry.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.table
            .entries
            .iter()
            .cloned()
            .map(|entry| tokio::spawn(run_entry(entry, self.job.clone(), cancel.clone())))
            .collect()
    }
}

async fn run_entry(entry: ScheduleEntry, job: Arc<RedispatchJob>, cancel: CancellationToken) {
    event!(Level::INFO, status = %entry.target_status, trigger = %entry.trigger, "schedule armed");
    loop {
        let now = local_now();
        let wait = (entry.trigger.next_after(now) - now)
            .to_std()
            .unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            _ = sleep(wait) => {
                let span = info_span!("redispatch", status = %entry.target_status);
                job.run_once(&entry.target_status).instrument(span).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::core::{Result, parse_timestamp};
    use crate::dispatch::{Announcer, DeliverySettings, OutputSwitches};
    use crate::registry::DestinationBook;
    use crate::storage::{MemoryArchive, MemoryCollection};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Never idle, so every admitted delivery stays running.
    struct BusyDevice;

    #[async_trait]
    impl Announcer for BusyDevice {
        async fn control(&self, _address: &str, _query: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn is_idle(&self, _address: &str) -> Result<bool> {
            Ok(false)
        }
    }

    async fn job() -> (RedispatchJob, SignalStore, Dispatcher) {
        let cancel = CancellationToken::new();
        let (store, _) = SignalStore::open(
            &StoreConfig::default().batch_wait_ms(5),
            Arc::new(MemoryCollection::new()),
            Arc::new(MemoryArchive::new()),
            cancel.clone(),
        )
        .await;
        let dispatcher = Dispatcher::spawn_with(
            DeliverySettings {
                settle_delay: Duration::ZERO,
                post_send_pause: Duration::ZERO,
                completion_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
            },
            Duration::from_millis(10),
            OutputSwitches::new(true, true),
            Arc::new(BusyDevice),
            cancel,
        );
        let book = DestinationBook::from_lines(&["10.0.0.1\tA", "10.0.0.2\tB"]);
        let (registry, _) = ClientRegistry::build(
            &book,
            &[("Press1\ttrue\t60\tsilent", "ALL"), ("Press2\tfalse\t0\t", "2")],
            parse_timestamp("2024/01/01 00:00:00.000").unwrap(),
        );
        (
            RedispatchJob::new(store.clone(), dispatcher.clone(), registry),
            store,
            dispatcher,
        )
    }

    fn record(time: &str, client: &str, status: &str) -> MessageRecord {
        MessageRecord::new(parse_timestamp(time).unwrap(), client, status, "msg")
    }

    #[tokio::test]
    async fn test_latest_record_per_client_is_sent_and_once_finalized() {
        let (job, store, dispatcher) = job().await;
        store
            .save_all(vec![
                record("2024/01/01 10:00:00.000", "Press1", "NG"),
                record("2024/01/01 10:05:00.000", "Press1", "NG"),
                record("2024/01/01 10:01:00.000", "Press2", "NG")
                    .with_check_style(CheckStyle::Recurring),
                record("2024/01/01 10:02:00.000", "Press1", "OK"),
                record("2024/01/01 10:03:00.000", "Stranger", "NG"),
            ])
            .unwrap();
        store.flush().await.unwrap();

        let report = job.run_once("NG").await;
        assert_eq!(report.notices_enqueued, 3);
        assert_eq!(report.finalized, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.running_count(), 3);

        let records = store.load_all().await;
        let acked: Vec<_> = records.iter().filter(|r| r.acknowledged).collect();
        assert_eq!(acked.len(), 2);
        assert!(acked.iter().all(|r| r.client_name == "Press1" && r.status == "NG"));
        // Recurring and unregistered records stay open.
        assert!(records.iter().any(|r| r.client_name == "Press2" && !r.acknowledged));
        assert!(records.iter().any(|r| r.client_name == "Stranger" && !r.acknowledged));

        let again = job.run_once("NG").await;
        assert_eq!(again.finalized, 0);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let (job, _, _) = job().await;
        assert_eq!(job.run_once("NG").await, RedispatchReport::default());
    }
}
