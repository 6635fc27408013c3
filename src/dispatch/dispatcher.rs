use super::announcer::Announcer;
use super::delivery::{DeliveryOutcome, DeliverySettings, NoticeDelivery, OutputSwitches};
use super::notice::{FailureRecord, NoticeKey, PendingNotice};
use crate::config::DispatchConfig;
use crate::core::MessageRecord;
use crate::registry::ClientRegistration;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

struct DispatcherInner {
    pending: mpsc::UnboundedSender<PendingNotice>,
    running: DashMap<NoticeKey, NoticeDelivery>,
    failures: DashMap<String, FailureRecord>,
    switches: Arc<OutputSwitches>,
    announcer: Arc<dyn Announcer>,
    settings: DeliverySettings,
    cancel: CancellationToken,
}

impl DispatcherInner {
    fn tick(&self, pending: &mut mpsc::UnboundedReceiver<PendingNotice>) {
        self.reap();
        while let Ok(notice) = pending.try_recv() {
            self.admit(notice);
        }
    }

    fn reap(&self) -> usize {
        let finished: Vec<NoticeKey> = self
            .running
            .iter()
            .filter(|entry| entry.value().is_finished())
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for key in finished {
            if let Some((_, delivery)) = self.running.remove(&key) {
                self.record_outcome(&delivery);
                reaped += 1;
            }
        }
        reaped
    }

    fn admit(&self, notice: PendingNotice) {
        match self.running.entry(notice.key()) {
            Entry::Occupied(entry) => {
                event!(Level::DEBUG, key = %entry.key(), "notice already running; dropped");
            }
            Entry::Vacant(entry) => {
                event!(Level::INFO, key = %entry.key(), "notice admitted");
                entry.insert(NoticeDelivery::start(
                    notice,
                    self.announcer.clone(),
                    self.switches.clone(),
                    self.settings,
                    self.cancel.child_token(),
                ));
            }
        }
    }

    fn record_outcome(&self, delivery: &NoticeDelivery) {
        let notice = delivery.notice();
        match delivery.outcome() {
            Some(DeliveryOutcome::Delivered) => {
                if self.failures.remove(&notice.address).is_some() {
                    event!(Level::INFO, address = %notice.address, "device recovered");
                }
            }
            Some(DeliveryOutcome::TimedOut) => {
                let mut record = self
                    .failures
                    .entry(notice.address.clone())
                    .or_insert_with(|| FailureRecord {
                        address: notice.address.clone(),
                        last_failed_notice: notice.clone(),
                        fail_count: 0,
                    });
                record.fail_count += 1;
                record.last_failed_notice = notice.clone();
                event!(
                    Level::WARN,
                    address = %notice.address,
                    fail_count = record.fail_count,
                    "delivery timed out"
                );
            }
            Some(DeliveryOutcome::Yielded) | None => {}
        }
    }
}

/// Delivers notices to announcer devices, one task per notice, with at
/// most one delivery per [`NoticeKey`] in flight.
///
/// A single control loop admits queued notices and reaps finished
/// deliveries on a fixed tick.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    control: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dispatcher {
    pub fn spawn(
        config: &DispatchConfig,
        announcer: Arc<dyn Announcer>,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn_with(
            DeliverySettings::from(config),
            config.tick(),
            OutputSwitches::new(config.active, config.voice_enabled),
            announcer,
            cancel,
        )
    }

    pub fn spawn_with(
        settings: DeliverySettings,
        tick: Duration,
        switches: OutputSwitches,
        announcer: Arc<dyn Announcer>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DispatcherInner {
            pending: tx,
            running: DashMap::new(),
            failures: DashMap::new(),
            switches: Arc::new(switches),
            announcer,
            settings,
            cancel: cancel.child_token(),
        });
        let handle = tokio::spawn(control_loop(inner.clone(), rx, tick));

        Self {
            inner,
            control: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queues a notice. False if a delivery with the same key is running or
    /// the dispatcher has stopped.
    pub fn enqueue(&self, notice: PendingNotice) -> bool {
        if self.inner.running.contains_key(&notice.key()) {
            return false;
        }
        self.inner.pending.send(notice).is_ok()
    }

    /// Queues one notice per destination of `client`. True only if every
    /// destination accepted its notice.
    pub fn enqueue_for(&self, client: &ClientRegistration, record: &MessageRecord) -> bool {
        let mut all = true;
        for destination in client.destinations() {
            let notice = PendingNotice::for_record(&destination.address, record);
            all &= self.enqueue(notice);
        }
        all
    }

    /// Failure records, ordered by address.
    pub fn failures(&self) -> Vec<FailureRecord> {
        let mut records: Vec<FailureRecord> = self
            .inner
            .failures
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    pub fn failure(&self, address: &str) -> Option<FailureRecord> {
        self.inner.failures.get(address).map(|r| r.value().clone())
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    pub fn is_running(&self, key: &NoticeKey) -> bool {
        self.inner.running.contains_key(key)
    }

    pub fn set_active(&self, active: bool) {
        event!(Level::INFO, active = active, "dispatcher role changed");
        self.inner.switches.set_active(active);
    }

    pub fn set_voice_enabled(&self, enabled: bool) {
        event!(Level::INFO, voice_enabled = enabled, "voice output switched");
        self.inner.switches.set_voice_enabled(enabled);
    }

    pub fn is_active(&self) -> bool {
        self.inner.switches.is_active()
    }

    pub fn voice_enabled(&self) -> bool {
        self.inner.switches.voice_enabled()
    }

    /// Stops admitting notices, gives running deliveries up to `grace` to
    /// finish, then detaches the rest. Returns how many were detached.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.inner.cancel.cancel();
        if let Some(handle) = self.control.lock().await.take() {
            if let Err(err) = handle.await {
                event!(Level::ERROR, error = %err, "dispatcher control loop failed");
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            self.inner.reap();
            if self.inner.running.is_empty() || Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let leftover: Vec<NoticeKey> = self
            .inner
            .running
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in &leftover {
            if let Some((_, delivery)) = self.inner.running.remove(key) {
                let phase = delivery.phase();
                let notice = delivery.detach();
                event!(
                    Level::WARN,
                    address = %notice.address,
                    phase = ?phase,
                    "delivery detached at shutdown"
                );
            }
        }
        leftover.len()
    }
}

async fn control_loop(
    inner: Arc<DispatcherInner>,
    mut pending: mpsc::UnboundedReceiver<PendingNotice>,
    tick: Duration,
) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                inner.tick(&mut pending);
            }
        }
    }

    pending.close();
    let mut discarded = 0usize;
    while pending.try_recv().is_ok() {
        discarded += 1;
    }
    for entry in inner.running.iter() {
        entry.value().cancel();
    }
    event!(Level::INFO, discarded = discarded, "dispatcher control loop stopped");
}
