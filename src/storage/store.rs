use super::archive::{SweepReport, plan_sweep};
use super::engine::{ArchiveProvider, MessageCollection};
use crate::config::StoreConfig;
use crate::core::{MessageRecord, RecordKey, Result, SignalError, local_now};
use chrono::{NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Health of the durable backend as last observed by the writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state")]
pub enum StorageStatus {
    Available,
    Unavailable {
        reason: String,
        since: NaiveDateTime,
    },
}

impl StorageStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Counters shown on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub hot_records: usize,
    pub last_update_time: Option<NaiveDateTime>,
    pub last_sweep_time: Option<NaiveDateTime>,
    pub status: StorageStatus,
}

#[derive(Default)]
struct HotIndex {
    records: HashMap<RecordKey, MessageRecord>,
    last_update: Option<NaiveDateTime>,
    last_sweep: Option<NaiveDateTime>,
}

impl HotIndex {
    fn apply(&mut self, record: MessageRecord) {
        match self.records.get_mut(&record.key()) {
            Some(existing) => existing.update_from(&record),
            None => {
                self.records.insert(record.key(), record);
            }
        }
    }

    fn replace(&mut self, records: Vec<MessageRecord>) {
        self.records = records.into_iter().map(|r| (r.key(), r)).collect();
    }
}

enum StoreCommand {
    Upsert(MessageRecord),
    Flush(oneshot::Sender<()>),
    Refresh(oneshot::Sender<Result<usize>>),
    Sweep {
        now: NaiveDateTime,
        reply: oneshot::Sender<SweepReport>,
    },
}

/// The authoritative record set: a hot in-memory index in front of a
/// durable collection, with month archives behind it.
///
/// Cloning is cheap; every clone talks to the same writer task. Saves are
/// applied to the index by that task before they reach the durable
/// collection, in batches.
#[derive(Clone)]
pub struct SignalStore {
    index: Arc<RwLock<HotIndex>>,
    commands: mpsc::UnboundedSender<StoreCommand>,
    status: watch::Receiver<StorageStatus>,
    refresh_timeout: Duration,
}

impl SignalStore {
    /// Loads the hot collection and starts the writer task.
    ///
    /// A failing initial load leaves the store empty and marked
    /// unavailable rather than refusing to start.
    pub async fn open(
        config: &StoreConfig,
        hot: Arc<dyn MessageCollection>,
        archive: Arc<dyn ArchiveProvider>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let mut index = HotIndex::default();
        let initial_status = match hot.load_all().await {
            Ok(records) => {
                event!(Level::INFO, records = records.len(), "hot collection loaded");
                index.replace(records);
                StorageStatus::Available
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "failed to load hot collection");
                StorageStatus::Unavailable {
                    reason: err.to_string(),
                    since: local_now(),
                }
            }
        };

        let index = Arc::new(RwLock::new(index));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(initial_status);

        let writer = StoreWriter {
            index: index.clone(),
            hot,
            archive,
            commands: command_rx,
            status: status_tx,
            cancel,
            retention: config.retention(),
            sweep_interval: config.sweep_interval(),
            batch_size: config.batch_size.max(1),
            batch_wait: config.batch_wait(),
        };
        let handle = tokio::spawn(writer.run());

        let store = Self {
            index,
            commands: command_tx,
            status: status_rx,
            refresh_timeout: config.refresh_timeout(),
        };
        (store, handle)
    }

    /// Queues an upsert. Fails only once the writer has stopped.
    pub fn save(&self, record: MessageRecord) -> Result<()> {
        self.commands
            .send(StoreCommand::Upsert(record))
            .map_err(|_| SignalError::ChannelClosed("signal store is closed".to_string()))
    }

    pub fn save_all<I>(&self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = MessageRecord>,
    {
        for record in records {
            self.save(record)?;
        }
        Ok(())
    }

    /// Point-in-time copy of the hot window, oldest first.
    pub async fn load_all(&self) -> Vec<MessageRecord> {
        self.select(|_| true).await
    }

    /// Hot records matching `filter`, oldest first.
    pub async fn select<F>(&self, filter: F) -> Vec<MessageRecord>
    where
        F: Fn(&MessageRecord) -> bool,
    {
        let index = self.index.read().await;
        let mut records: Vec<MessageRecord> =
            index.records.values().filter(|r| filter(r)).cloned().collect();
        records.sort_by(|a, b| {
            a.connect_time
                .cmp(&b.connect_time)
                .then_with(|| a.client_name.cmp(&b.client_name))
        });
        records
    }

    pub async fn get(&self, key: &RecordKey) -> Option<MessageRecord> {
        self.index.read().await.records.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.records.is_empty()
    }

    /// Waits until every save queued before this call has been applied in
    /// memory and attempted durably.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_control(StoreCommand::Flush(tx))?;
        rx.await
            .map_err(|_| SignalError::ChannelClosed("signal store is closed".to_string()))
    }

    /// Replaces the hot index with the durable collection's contents.
    /// Returns the number of records loaded.
    pub async fn refresh(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send_control(StoreCommand::Refresh(tx))?;
        match timeout(self.refresh_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalError::ChannelClosed(
                "signal store is closed".to_string(),
            )),
            Err(_) => Err(SignalError::Timeout(format!(
                "refresh did not finish within {:?}",
                self.refresh_timeout
            ))),
        }
    }

    /// Runs an archival sweep against the current wall clock.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweep_at(local_now()).await
    }

    /// Runs an archival sweep as if the clock read `now`.
    pub async fn sweep_at(&self, now: NaiveDateTime) -> Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.send_control(StoreCommand::Sweep { now, reply: tx })?;
        rx.await
            .map_err(|_| SignalError::ChannelClosed("signal store is closed".to_string()))
    }

    pub fn status(&self) -> StorageStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every storage status change.
    pub fn subscribe_status(&self) -> watch::Receiver<StorageStatus> {
        self.status.clone()
    }

    pub async fn stats(&self) -> StoreStats {
        let index = self.index.read().await;
        StoreStats {
            hot_records: index.records.len(),
            last_update_time: index.last_update,
            last_sweep_time: index.last_sweep,
            status: self.status(),
        }
    }

    fn send_control(&self, command: StoreCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SignalError::ChannelClosed("signal store is closed".to_string()))
    }
}

struct StoreWriter {
    index: Arc<RwLock<HotIndex>>,
    hot: Arc<dyn MessageCollection>,
    archive: Arc<dyn ArchiveProvider>,
    commands: mpsc::UnboundedReceiver<StoreCommand>,
    status: watch::Sender<StorageStatus>,
    cancel: CancellationToken,
    retention: TimeDelta,
    sweep_interval: Duration,
    batch_size: usize,
    batch_wait: Duration,
}

impl StoreWriter {
    async fn run(mut self) {
        let mut sweep_timer = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    }
                }
                _ = sweep_timer.tick() => {
                    self.sweep(local_now()).await;
                }
            }
        }

        // Refuse new work, then apply whatever was already queued.
        self.commands.close();
        let mut drained = 0usize;
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
            drained += 1;
        }
        event!(Level::INFO, drained = drained, "store writer stopped");
    }

    async fn handle(&mut self, command: StoreCommand) {
        let trailing = match command {
            StoreCommand::Upsert(first) => {
                let (batch, trailing) = self.collect_batch(first).await;
                self.persist(batch).await;
                trailing
            }
            other => Some(other),
        };

        match trailing {
            None | Some(StoreCommand::Upsert(_)) => {}
            Some(StoreCommand::Flush(reply)) => {
                let _ = reply.send(());
            }
            Some(StoreCommand::Refresh(reply)) => {
                let _ = reply.send(self.reload().await);
            }
            Some(StoreCommand::Sweep { now, reply }) => {
                let _ = reply.send(self.sweep(now).await);
            }
        }
    }

    /// Applies `first` and whatever upserts follow it within the batch
    /// window. A control command ends the batch and is handed back.
    async fn collect_batch(
        &mut self,
        first: MessageRecord,
    ) -> (Vec<MessageRecord>, Option<StoreCommand>) {
        let deadline = Instant::now() + self.batch_wait;
        self.apply(&first).await;
        let mut batch = vec![first];

        while batch.len() < self.batch_size {
            match timeout_at(deadline, self.commands.recv()).await {
                Ok(Some(StoreCommand::Upsert(record))) => {
                    self.apply(&record).await;
                    batch.push(record);
                }
                Ok(Some(other)) => return (batch, Some(other)),
                Ok(None) | Err(_) => break,
            }
        }
        (batch, None)
    }

    async fn apply(&self, record: &MessageRecord) {
        let mut index = self.index.write().await;
        index.apply(record.clone());
        index.last_update = Some(local_now());
    }

    async fn persist(&self, batch: Vec<MessageRecord>) {
        let span = info_span!("store.batch", records = batch.len());
        let result = self.hot.upsert(&batch).instrument(span).await;
        match result {
            Ok(()) => self.mark_available(),
            Err(err) => {
                event!(
                    Level::ERROR,
                    error = %err,
                    records = batch.len(),
                    "durable write failed; records stay in memory only"
                );
                self.mark_unavailable(&err);
            }
        }
    }

    async fn reload(&self) -> Result<usize> {
        match self.hot.load_all().await {
            Ok(records) => {
                let count = records.len();
                self.index.write().await.replace(records);
                self.mark_available();
                event!(Level::INFO, records = count, "hot index reloaded");
                Ok(count)
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "hot index reload failed");
                self.mark_unavailable(&err);
                Err(err)
            }
        }
    }

    /// Moves records older than the retention window into their month
    /// archives. Runs on the writer task, so the index cannot change while
    /// a sweep is in progress.
    async fn sweep(&self, now: NaiveDateTime) -> SweepReport {
        let cutoff = now - self.retention;
        let span = info_span!("store.sweep", cutoff = %cutoff);
        async {
            let plan = {
                let index = self.index.read().await;
                plan_sweep(index.records.values(), cutoff)
            };

            let mut report = SweepReport {
                cutoff: Some(cutoff),
                ..SweepReport::default()
            };

            for (month, records) in plan {
                let moved = async {
                    let collection = self.archive.month(month).await?;
                    collection.upsert(&records).await
                }
                .await;

                match moved {
                    Ok(()) => {
                        report.archived.push((month.to_string(), records.len()));
                        report.moved_keys.extend(records.iter().map(MessageRecord::key));
                    }
                    Err(err) => {
                        event!(Level::WARN, month = %month, error = %err, "archive month failed; retrying next sweep");
                        report.failed.push(month.to_string());
                    }
                }
            }

            {
                let mut index = self.index.write().await;
                for key in &report.moved_keys {
                    index.records.remove(key);
                }
                index.last_sweep = Some(now);
            }

            if !report.moved_keys.is_empty() {
                if let Err(err) = self.hot.delete(&report.moved_keys).await {
                    event!(Level::WARN, error = %err, "failed to delete archived records from hot collection");
                }
                event!(Level::INFO, moved = report.moved(), months = report.archived.len(), "sweep finished");
            }
            report
        }
        .instrument(span)
        .await
    }

    fn mark_available(&self) {
        self.status.send_if_modified(|current| {
            if current.is_available() {
                false
            } else {
                event!(Level::INFO, "durable backend available again");
                *current = StorageStatus::Available;
                true
            }
        });
    }

    fn mark_unavailable(&self, err: &SignalError) {
        self.status.send_if_modified(|current| {
            if current.is_available() {
                *current = StorageStatus::Unavailable {
                    reason: err.to_string(),
                    since: local_now(),
                };
                true
            } else {
                false
            }
        });
    }
}
