//! End-to-end behavior of the ingestion, liveness and notification path

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sigrelay::config::{IngestConfig, StoreConfig};
use sigrelay::core::{TIMEOUT_STATUS, parse_timestamp};
use sigrelay::dispatch::{Announcer, DeliverySettings, Dispatcher, OutputSwitches, PendingNotice};
use sigrelay::ingest::{IngestBridge, STORAGE_UNAVAILABLE};
use sigrelay::liveness::LivenessMonitor;
use sigrelay::registry::{ClientRegistry, DestinationBook, LivenessWriter};
use sigrelay::schedule::RedispatchJob;
use sigrelay::server::stamp_lines;
use sigrelay::storage::{MemoryArchive, MemoryCollection, SignalStore};
use sigrelay::{CheckStyle, MessageRecord, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Records control requests. Optionally stays busy once it has spoken.
#[derive(Default)]
struct RecordingDevice {
    busy_after_send: bool,
    speaking: AtomicBool,
    controls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Announcer for RecordingDevice {
    async fn control(&self, address: &str, query: &str) -> Result<String> {
        self.controls
            .lock()
            .unwrap()
            .push((address.to_string(), query.to_string()));
        self.speaking.store(true, Ordering::SeqCst);
        Ok("OK".to_string())
    }

    async fn is_idle(&self, _address: &str) -> Result<bool> {
        Ok(!(self.busy_after_send && self.speaking.load(Ordering::SeqCst)))
    }
}

struct Harness {
    store: SignalStore,
    hot: Arc<MemoryCollection>,
    bridge: IngestBridge,
    dispatcher: Dispatcher,
    device: Arc<RecordingDevice>,
}

async fn harness(device: RecordingDevice) -> Harness {
    let cancel = CancellationToken::new();
    let hot = Arc::new(MemoryCollection::new());
    let (store, _) = SignalStore::open(
        &StoreConfig::default().batch_wait_ms(5),
        hot.clone(),
        Arc::new(MemoryArchive::new()),
        cancel.clone(),
    )
    .await;
    let (bridge, _) = IngestBridge::spawn(
        &IngestConfig::default().batch_wait_ms(10),
        store.clone(),
        cancel.clone(),
    );
    let device = Arc::new(device);
    let dispatcher = Dispatcher::spawn_with(
        DeliverySettings {
            settle_delay: Duration::ZERO,
            post_send_pause: Duration::ZERO,
            completion_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        },
        Duration::from_millis(10),
        OutputSwitches::new(true, true),
        device.clone(),
        cancel,
    );
    Harness {
        store,
        hot,
        bridge,
        dispatcher,
        device,
    }
}

fn at(text: &str) -> NaiveDateTime {
    parse_timestamp(text).unwrap()
}

fn registry(
    clients: &[(&str, &str)],
    loaded_at: NaiveDateTime,
) -> (ClientRegistry, Vec<LivenessWriter>) {
    let book = DestinationBook::from_lines(&["10.0.0.1\tHall", "10.0.0.2\tYard"]);
    ClientRegistry::build(&book, clients, loaded_at)
}

#[tokio::test]
async fn ingested_line_round_trips_through_the_store() {
    let h = harness(RecordingDevice::default()).await;
    h.bridge
        .submit("2024/01/01 10:00:00.000\tPress1\tOK\tAll Clear\tp1\tOnce")
        .await
        .unwrap();
    h.bridge.flush().await.unwrap();

    let records = h.store.load_all().await;
    assert_eq!(
        records,
        vec![
            MessageRecord::new(at("2024/01/01 10:00:00.000"), "Press1", "OK", "All Clear")
                .with_parameter("p1")
                .with_check_style(CheckStyle::Once)
        ]
    );
    assert!(!records[0].acknowledged);
}

#[tokio::test]
async fn saving_the_same_key_twice_keeps_the_second_fields() {
    let h = harness(RecordingDevice::default()).await;
    h.bridge
        .submit("2024/01/01 10:00:00.000\tPress1\tOK\tfirst")
        .await
        .unwrap();
    h.bridge
        .submit("2024/01/01 10:00:00.000\tPress1\tNG\tsecond")
        .await
        .unwrap();
    h.bridge.flush().await.unwrap();

    let records = h.store.load_all().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "NG");
    assert_eq!(records[0].message, "second");
    assert_eq!(h.hot.len().await, 1);
}

#[tokio::test]
async fn lines_of_one_payload_keep_distinct_records() {
    let h = harness(RecordingDevice::default()).await;
    for line in stamp_lines("Press1\tNG\tJam\nPress1\tNG\tOil low", at("2024/01/01 10:00:00.000")) {
        h.bridge.submit(line).await.unwrap();
    }
    h.bridge.flush().await.unwrap();

    let records = h.store.load_all().await;
    let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["Jam", "Oil low"]);
    assert_eq!(records[1].connect_time, at("2024/01/01 10:00:00.001"));
}

#[tokio::test]
async fn malformed_line_is_dropped_and_counted() {
    let h = harness(RecordingDevice::default()).await;
    h.bridge
        .submit("2024/01/01 10:00:00.000\tPress1")
        .await
        .unwrap();
    h.bridge.flush().await.unwrap();

    assert!(h.store.is_empty().await);
    let stats = h.bridge.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.accepted, 0);
}

#[tokio::test]
async fn storage_failure_surfaces_sentinel_but_keeps_records() {
    let h = harness(RecordingDevice::default()).await;
    h.hot.set_fail_writes(true);
    h.bridge
        .submit("2024/01/01 10:00:00.000\tPress1\tNG\tJam")
        .await
        .unwrap();
    h.bridge.flush().await.unwrap();

    for _ in 0..50 {
        if h.bridge.response() == STORAGE_UNAVAILABLE {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.bridge.response(), STORAGE_UNAVAILABLE);
    assert!(!h.store.status().is_available());
    assert_eq!(h.store.load_all().await.len(), 1);
    assert!(h.hot.is_empty().await);
}

#[tokio::test]
async fn redispatch_sends_per_destination_then_finalizes() {
    let h = harness(RecordingDevice::default()).await;
    let (registry, _writers) = registry(
        &[("Press1\ttrue\t300\tsilent", "ALL")],
        at("2024/01/01 09:00:00.000"),
    );
    h.store
        .save(
            MessageRecord::new(at("2024/01/01 10:00:00.000"), "Press1", "NG", "Jam")
                .with_parameter("led=1"),
        )
        .unwrap();
    h.store.flush().await.unwrap();

    let job = RedispatchJob::new(h.store.clone(), h.dispatcher.clone(), registry);
    let report = job.run_once("NG").await;
    assert_eq!(report.notices_enqueued, 2);
    assert_eq!(report.finalized, 1);

    let record = h.store.load_all().await.remove(0);
    assert!(record.acknowledged);

    for _ in 0..100 {
        if h.device.controls.lock().unwrap().len() == 2 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let mut controls = h.device.controls.lock().unwrap().clone();
    controls.sort();
    assert_eq!(
        controls,
        vec![
            ("10.0.0.1".to_string(), "led=1&speech=Jam".to_string()),
            ("10.0.0.2".to_string(), "led=1&speech=Jam".to_string()),
        ]
    );
}

#[tokio::test]
async fn identical_notices_are_never_delivered_concurrently() {
    let h = harness(RecordingDevice {
        busy_after_send: true,
        ..Default::default()
    })
    .await;
    let notice = PendingNotice::new("10.0.0.1", "Jam", "", at("2024/01/01 10:00:00.000"));

    assert!(h.dispatcher.enqueue(notice.clone()));
    for _ in 0..100 {
        if h.dispatcher.is_running(&notice.key()) {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(h.dispatcher.is_running(&notice.key()));
    assert!(!h.dispatcher.enqueue(notice.clone()));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.dispatcher.running_count(), 1);
    assert_eq!(h.device.controls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn silent_client_produces_one_timeout_until_fresh_data() {
    let h = harness(RecordingDevice::default()).await;
    let loaded = at("2024/01/01 10:00:00.000");
    let (registry, writers) = registry(&[("Press1\ttrue\t60\tPress1 silent", "1")], loaded);
    let monitor = LivenessMonitor::new(
        registry.clone(),
        writers,
        h.store.clone(),
        h.dispatcher.clone(),
        "beep=2",
    );

    assert_eq!(monitor.check_once(at("2024/01/01 10:01:30.000")).await.len(), 1);
    assert!(monitor.check_once(at("2024/01/01 10:02:00.000")).await.is_empty());
    assert!(monitor.check_once(at("2024/01/01 10:10:00.000")).await.is_empty());

    let timeouts = h.store.select(|r| r.status == TIMEOUT_STATUS).await;
    assert_eq!(timeouts.len(), 1);
    assert!(!timeouts[0].acknowledged);
    assert_eq!(timeouts[0].parameter, "beep=2");

    // Fresh data starts a new episode once the client goes quiet again.
    h.bridge
        .submit("2024/01/01 10:11:00.000\tPress1\tOK\tback")
        .await
        .unwrap();
    h.bridge.flush().await.unwrap();
    assert!(monitor.check_once(at("2024/01/01 10:11:30.000")).await.is_empty());
    assert_eq!(monitor.check_once(at("2024/01/01 10:12:30.000")).await.len(), 1);

    let view = registry.get("Press1").unwrap().liveness();
    assert_eq!(view.last_access(), Some(at("2024/01/01 10:11:00.000")));
    assert_eq!(view.last_timeout_detected(), Some(at("2024/01/01 10:12:30.000")));
}
