use super::decoder::decode_line;
use crate::config::IngestConfig;
use crate::core::{MessageRecord, Result, SignalError};
use crate::storage::{SignalStore, StorageStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// Response handed to socket peers while the durable backend rejects writes.
pub const STORAGE_UNAVAILABLE: &str = "DatabaseLocked";

enum BridgeInput {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Counters of the ingestion path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Lines decoded and handed to the store.
    pub accepted: u64,
    /// Lines rejected by the decoder or refused by a closed store.
    pub dropped: u64,
    /// Oldest lines discarded to make room under overflow.
    pub evicted: u64,
    /// Lines waiting in the queue.
    pub queued: usize,
}

#[derive(Default)]
struct BridgeShared {
    response: RwLock<String>,
    accepted: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    pending_evictions: AtomicUsize,
}

impl BridgeShared {
    fn set_response(&self, text: &str) {
        match self.response.write() {
            Ok(mut response) => {
                if *response != text {
                    *response = text.to_string();
                }
            }
            Err(err) => event!(Level::ERROR, error = %err, "response lock poisoned"),
        }
    }

    fn observe(&self, status: &StorageStatus) {
        match status {
            StorageStatus::Unavailable { reason, .. } => {
                event!(Level::WARN, reason = %reason, "storage unavailable; peers will be told");
                self.set_response(STORAGE_UNAVAILABLE);
            }
            StorageStatus::Available => {
                let locked = self
                    .response
                    .read()
                    .map(|r| r.as_str() == STORAGE_UNAVAILABLE)
                    .unwrap_or(false);
                if locked {
                    self.set_response("");
                }
            }
        }
    }

    /// Consumes one pending eviction, if any.
    fn take_eviction(&self) -> bool {
        self.pending_evictions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Turns raw received lines into records and feeds them to the store in
/// batches.
///
/// The line queue is bounded: producers using [`IngestBridge::submit`]
/// wait for room, which is how a slow store pushes back on the listener.
#[derive(Clone)]
pub struct IngestBridge {
    lines: mpsc::Sender<BridgeInput>,
    shared: Arc<BridgeShared>,
}

impl IngestBridge {
    pub fn spawn(
        config: &IngestConfig,
        store: SignalStore,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.line_queue_capacity.max(1));
        let shared = Arc::new(BridgeShared::default());
        shared.observe(&store.status());

        let worker = BridgeWorker {
            lines: rx,
            shared: shared.clone(),
            store,
            cancel,
            batch_size: config.batch_size.max(1),
            batch_wait: config.batch_wait(),
        };
        let handle = tokio::spawn(worker.run());

        (Self { lines: tx, shared }, handle)
    }

    /// Queues a line, waiting for capacity.
    pub async fn submit(&self, line: impl Into<String>) -> Result<()> {
        self.lines
            .send(BridgeInput::Line(line.into()))
            .await
            .map_err(|_| closed())
    }

    /// Queues a line if there is room right now.
    pub fn try_submit(&self, line: impl Into<String>) -> Result<()> {
        match self.lines.try_send(BridgeInput::Line(line.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SignalError::QueueFull(
                "ingestion queue is full".to_string(),
            )),
            Err(TrySendError::Closed(_)) => Err(closed()),
        }
    }

    /// Queues a line, discarding the oldest queued line when full.
    pub async fn submit_evicting(&self, line: impl Into<String>) -> Result<()> {
        match self.lines.try_send(BridgeInput::Line(line.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(input)) => {
                self.shared.pending_evictions.fetch_add(1, Ordering::SeqCst);
                self.lines.send(input).await.map_err(|_| closed())
            }
            Err(TrySendError::Closed(_)) => Err(closed()),
        }
    }

    /// Waits until every line queued before the call has been decoded and
    /// flushed through the store.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.lines
            .send(BridgeInput::Flush(tx))
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Text returned to the next socket peer; empty while all is well.
    pub fn response(&self) -> String {
        self.shared
            .response
            .read()
            .map(|r| r.clone())
            .unwrap_or_else(|_| STORAGE_UNAVAILABLE.to_string())
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
            queued: self.lines.max_capacity() - self.lines.capacity(),
        }
    }
}

fn closed() -> SignalError {
    SignalError::ChannelClosed("ingestion bridge is closed".to_string())
}

struct BridgeWorker {
    lines: mpsc::Receiver<BridgeInput>,
    shared: Arc<BridgeShared>,
    store: SignalStore,
    cancel: CancellationToken,
    batch_size: usize,
    batch_wait: Duration,
}

impl BridgeWorker {
    async fn run(mut self) {
        let mut status = self.store.subscribe_status();
        let mut status_open = true;
        let mut batch: Vec<MessageRecord> = Vec::with_capacity(self.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let flush_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                input = self.lines.recv() => {
                    match input {
                        Some(BridgeInput::Line(line)) => {
                            if self.shared.take_eviction() {
                                self.shared.evicted.fetch_add(1, Ordering::Relaxed);
                                event!(Level::WARN, "line queue overflow; oldest line discarded");
                                continue;
                            }
                            self.accept(&line, &mut batch);
                            if batch.len() >= self.batch_size {
                                self.flush_batch(&mut batch);
                                deadline = None;
                            } else if deadline.is_none() && !batch.is_empty() {
                                deadline = Some(Instant::now() + self.batch_wait);
                            }
                        }
                        Some(BridgeInput::Flush(reply)) => {
                            self.flush_batch(&mut batch);
                            deadline = None;
                            if let Err(err) = self.store.flush().await {
                                event!(Level::WARN, error = %err, "store flush failed");
                            }
                            let _ = reply.send(());
                        }
                        None => break,
                    }
                }
                _ = sleep_until(flush_at), if deadline.is_some() => {
                    self.flush_batch(&mut batch);
                    deadline = None;
                }
                changed = status.changed(), if status_open => {
                    match changed {
                        Ok(()) => {
                            let current = status.borrow_and_update().clone();
                            self.shared.observe(&current);
                        }
                        Err(_) => status_open = false,
                    }
                }
            }
        }

        self.lines.close();
        while let Some(input) = self.lines.recv().await {
            match input {
                BridgeInput::Line(line) => self.accept(&line, &mut batch),
                BridgeInput::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        self.flush_batch(&mut batch);
        event!(Level::INFO, "ingestion bridge stopped");
    }

    fn accept(&self, line: &str, batch: &mut Vec<MessageRecord>) {
        match decode_line(line) {
            Ok(record) => batch.push(record),
            Err(err) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                event!(Level::WARN, error = %err, line = %line, "dropping malformed line");
            }
        }
    }

    fn flush_batch(&self, batch: &mut Vec<MessageRecord>) {
        for record in batch.drain(..) {
            let key = record.key();
            match self.store.save(record) {
                Ok(()) => {
                    self.shared.accepted.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    self.shared.set_response(STORAGE_UNAVAILABLE);
                    event!(Level::ERROR, key = %key, error = %err, "store refused record");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{MemoryArchive, MemoryCollection};

    async fn setup(
        config: IngestConfig,
    ) -> (IngestBridge, SignalStore, Arc<MemoryCollection>, CancellationToken) {
        let hot = Arc::new(MemoryCollection::new());
        let cancel = CancellationToken::new();
        let (store, _) = SignalStore::open(
            &StoreConfig::default().batch_wait_ms(10),
            hot.clone(),
            Arc::new(MemoryArchive::new()),
            cancel.clone(),
        )
        .await;
        let (bridge, _) = IngestBridge::spawn(&config, store.clone(), cancel.clone());
        (bridge, store, hot, cancel)
    }

    #[tokio::test]
    async fn test_lines_reach_store() {
        let (bridge, store, _, _) = setup(IngestConfig::default()).await;
        bridge
            .submit("2024/01/01 10:00:00.000\tPress1\tOK\tAll Clear\tp1\tOnce")
            .await
            .unwrap();
        bridge.submit("not a record").await.unwrap();
        bridge.flush().await.unwrap();

        let records = store.load_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parameter, "p1");
        let stats = bridge.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(bridge.response(), "");
    }

    #[tokio::test]
    async fn test_batch_wait_flushes_partial_batch() {
        let (bridge, store, _, _) =
            setup(IngestConfig::default().batch_size(50).batch_wait_ms(20)).await;
        bridge
            .submit("2024/01/01 10:00:00.000\tPress1\tOK\tmsg")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sentinel_follows_storage_status() {
        let (bridge, store, hot, _) = setup(IngestConfig::default()).await;
        hot.set_fail_writes(true);
        bridge
            .submit("2024/01/01 10:00:00.000\tPress1\tOK\tmsg")
            .await
            .unwrap();
        bridge.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bridge.response(), STORAGE_UNAVAILABLE);
        assert_eq!(store.load_all().await.len(), 1);

        hot.set_fail_writes(false);
        bridge
            .submit("2024/01/01 10:00:01.000\tPress1\tOK\tmsg")
            .await
            .unwrap();
        bridge.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bridge.response(), "");
    }

    #[tokio::test]
    async fn test_try_submit_rejects_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let bridge = IngestBridge {
            lines: tx,
            shared: Arc::new(BridgeShared::default()),
        };

        bridge.try_submit("2024/01/01 10:00:00.000\tA\tOK\tmsg").unwrap();
        let second = bridge.try_submit("2024/01/01 10:00:01.000\tA\tOK\tmsg");
        assert!(matches!(second, Err(SignalError::QueueFull(_))));
        assert_eq!(bridge.stats().queued, 1);

        rx.close();
        while rx.recv().await.is_some() {}
        assert!(matches!(
            bridge.try_submit("2024/01/01 10:00:02.000\tA\tOK\tmsg"),
            Err(SignalError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_eviction_discards_oldest() {
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(BridgeShared::default());
        let bridge = IngestBridge {
            lines: tx,
            shared: shared.clone(),
        };
        bridge.submit("2024/01/01 10:00:00.000\tA\tOK\told").await.unwrap();

        let hot = Arc::new(MemoryCollection::new());
        let cancel = CancellationToken::new();
        let (store, _) = SignalStore::open(
            &StoreConfig::default().batch_wait_ms(10),
            hot,
            Arc::new(MemoryArchive::new()),
            cancel.clone(),
        )
        .await;

        let producer = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .submit_evicting("2024/01/01 10:00:01.000\tA\tOK\tnew")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(shared.pending_evictions.load(Ordering::SeqCst), 1);

        let worker = BridgeWorker {
            lines: rx,
            shared,
            store: store.clone(),
            cancel,
            batch_size: 10,
            batch_wait: Duration::from_millis(10),
        };
        tokio::spawn(worker.run());
        producer.await.unwrap().unwrap();
        bridge.flush().await.unwrap();

        let records = store.load_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "new");
        assert_eq!(bridge.stats().evicted, 1);
    }
}
