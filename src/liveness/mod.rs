//! Silence detection.
//!
//! The monitor owns every client's [`LivenessWriter`], so it is the only
//! code that moves `lastAccessTime` and `lastTimeoutDetectedTime`.

use crate::core::{CheckStyle, MessageRecord, RecordKey, TIMEOUT_STATUS, local_now};
use crate::dispatch::Dispatcher;
use crate::registry::{ClientRegistration, ClientRegistry, LivenessWriter};
use crate::storage::SignalStore;
use chrono::{NaiveDateTime, TimeDelta};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

pub struct LivenessMonitor {
    writers: Vec<LivenessWriter>,
    registry: ClientRegistry,
    store: SignalStore,
    dispatcher: Dispatcher,
    timeout_parameter: String,
}

impl LivenessMonitor {
    pub fn new(
        registry: ClientRegistry,
        writers: Vec<LivenessWriter>,
        store: SignalStore,
        dispatcher: Dispatcher,
        timeout_parameter: impl Into<String>,
    ) -> Self {
        Self {
            writers,
            registry,
            store,
            dispatcher,
            timeout_parameter: timeout_parameter.into(),
        }
    }

    /// Runs one pass over every client and returns the timeout records it
    /// created.
    pub async fn check_once(&self, now: NaiveDateTime) -> Vec<MessageRecord> {
        let records = self.store.load_all().await;
        let by_key: HashMap<RecordKey, &MessageRecord> =
            records.iter().map(|r| (r.key(), r)).collect();

        let mut created = Vec::new();
        for writer in &self.writers {
            let Some(client) = self.registry.get(writer.client_name()) else {
                continue;
            };
            if !client.timeout().enabled {
                continue;
            }

            let latest = records
                .iter()
                .filter(|r| r.client_name == client.name() && !r.is_timeout())
                .map(|r| r.connect_time)
                .max();
            if let Some(latest) = latest {
                writer.advance_access(latest);
            }

            if let Some(record) = self.detect(client, writer, &records, &by_key, now) {
                created.push(record);
            }
        }

        if !created.is_empty() {
            // Later passes must see these records before deciding again.
            if let Err(err) = self.store.flush().await {
                event!(Level::WARN, error = %err, "store flush after timeout detection failed");
            }
        }
        created
    }

    fn detect(
        &self,
        client: &ClientRegistration,
        writer: &LivenessWriter,
        records: &[MessageRecord],
        by_key: &HashMap<RecordKey, &MessageRecord>,
        now: NaiveDateTime,
    ) -> Option<MessageRecord> {
        let last_access = writer.last_access()?;
        if now - last_access <= client.timeout().threshold {
            return None;
        }

        // Only a timeout stamped inside the current silence counts; fresh
        // data since then opens a new episode.
        let open_timeout = records.iter().any(|r| {
            r.client_name == client.name()
                && r.is_timeout()
                && !r.acknowledged
                && r.connect_time >= last_access
        });
        if open_timeout {
            return None;
        }

        // Step past real records stamped at the same millisecond.
        let mut stamp = last_access;
        loop {
            match by_key.get(&RecordKey::new(client.name(), &stamp)) {
                Some(existing) if existing.is_timeout() => {
                    // This silence episode was already reported.
                    return None;
                }
                Some(_) => stamp += TimeDelta::milliseconds(1),
                None => break,
            }
        }

        let record = MessageRecord::new(
            stamp,
            client.name(),
            TIMEOUT_STATUS,
            client.timeout().message.clone(),
        )
        .with_parameter(self.timeout_parameter.clone())
        .with_check_style(CheckStyle::Once);

        if let Err(err) = self.store.save(record.clone()) {
            event!(Level::ERROR, client = %client.name(), error = %err, "failed to save timeout record");
            return None;
        }
        writer.mark_timeout_detected(now);
        let queued = self.dispatcher.enqueue_for(client, &record);
        event!(
            Level::WARN,
            client = %client.name(),
            last_access = %last_access,
            queued = queued,
            "client silent past its threshold"
        );
        Some(record)
    }

    /// Runs [`check_once`](Self::check_once) every `period` until cancelled.
    pub fn spawn(self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = local_now();
                        self.check_once(now)
                            .instrument(info_span!("liveness.check", now = %now))
                            .await;
                    }
                }
            }
            event!(Level::INFO, "liveness monitor stopped");
        })
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
    use std::sync::Arc;

    struct IdleDevice;

    #[async_trait]
    impl Announcer for IdleDevice {
        async fn control(&self, _address: &str, _query: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn is_idle(&self, _address: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn at(text: &str) -> NaiveDateTime {
        parse_timestamp(text).unwrap()
    }

    async fn monitor(lines: &[(&str, &str)], loaded_at: NaiveDateTime) -> (LivenessMonitor, SignalStore) {
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
                completion_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
            },
            Duration::from_millis(10),
            OutputSwitches::new(true, false),
            Arc::new(IdleDevice),
            cancel,
        );
        let book = DestinationBook::from_lines(&["10.0.0.1\tTower"]);
        let (registry, writers) = ClientRegistry::build(&book, lines, loaded_at);
        (
            LivenessMonitor::new(registry, writers, store.clone(), dispatcher, "beep=3"),
            store,
        )
    }

    #[tokio::test]
    async fn test_silent_client_gets_one_timeout() {
        let loaded = at("2024/01/01 10:00:00.000");
        let (monitor, store) = monitor(&[("Press1\ttrue\t60\tPress1 silent", "ALL")], loaded).await;

        assert!(monitor.check_once(at("2024/01/01 10:00:30.000")).await.is_empty());

        let created = monitor.check_once(at("2024/01/01 10:01:01.000")).await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, TIMEOUT_STATUS);
        assert_eq!(created[0].message, "Press1 silent");
        assert_eq!(created[0].parameter, "beep=3");
        assert_eq!(created[0].connect_time, loaded);

        assert!(monitor.check_once(at("2024/01/01 10:05:00.000")).await.is_empty());
        let timeouts = store.select(|r| r.is_timeout()).await;
        assert_eq!(timeouts.len(), 1);
        assert!(!timeouts[0].acknowledged);

        let view = monitor.registry.get("Press1").unwrap().liveness().clone();
        assert_eq!(view.last_timeout_detected(), Some(at("2024/01/01 10:01:01.000")));
    }

    #[tokio::test]
    async fn test_fresh_record_moves_access_time() {
        let loaded = at("2024/01/01 10:00:00.000");
        let (monitor, store) = monitor(&[("Press1\ttrue\t60\tsilent", "ALL")], loaded).await;
        store
            .save(MessageRecord::new(at("2024/01/01 10:00:50.000"), "Press1", "OK", ""))
            .unwrap();
        store.flush().await.unwrap();

        assert!(monitor.check_once(at("2024/01/01 10:01:30.000")).await.is_empty());
        let created = monitor.check_once(at("2024/01/01 10:01:51.000")).await;
        assert_eq!(created.len(), 1);
        // Stamped just past the real record it would otherwise overwrite.
        assert_eq!(created[0].connect_time, at("2024/01/01 10:00:50.001"));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_disabled_client_is_skipped() {
        let loaded = at("2024/01/01 10:00:00.000");
        let (monitor, store) = monitor(&[("Press1\tfalse\t1\tsilent", "ALL")], loaded).await;
        assert!(monitor.check_once(at("2024/01/02 00:00:00.000")).await.is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_acknowledged_episode_is_not_repeated() {
        let loaded = at("2024/01/01 10:00:00.000");
        let (monitor, store) = monitor(&[("Press1\ttrue\t60\tsilent", "ALL")], loaded).await;
        let created = monitor.check_once(at("2024/01/01 10:02:00.000")).await;
        assert_eq!(created.len(), 1);

        store.save(created[0].clone().acknowledged(true)).unwrap();
        store.flush().await.unwrap();
        assert!(monitor.check_once(at("2024/01/01 10:03:00.000")).await.is_empty());

        store
            .save(MessageRecord::new(at("2024/01/01 10:03:30.000"), "Press1", "OK", ""))
            .unwrap();
        store.flush().await.unwrap();
        let next = monitor.check_once(at("2024/01/01 10:05:00.000")).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].connect_time, at("2024/01/01 10:03:30.001"));
    }
}
