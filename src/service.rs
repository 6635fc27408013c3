//! Wires every component into one running backbone.

use crate::config::BackboneConfig;
use crate::core::{Result, SignalError, local_now};
use crate::dispatch::{Dispatcher, HttpAnnouncer};
use crate::ingest::IngestBridge;
use crate::liveness::LivenessMonitor;
use crate::registry::{ClientRegistry, DestinationBook};
use crate::schedule::{RedispatchJob, ScheduleTable, Scheduler};
use crate::server::SignalListener;
use crate::storage::{
    ArchiveProvider, DurabilityMode, FileArchive, FileCollection, MemoryArchive, MemoryCollection,
    MessageCollection, SignalStore,
};
use crate::web::{WebState, build_router};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

const HOT_COLLECTION_DIR: &str = "hot";

/// The running system.
///
/// Producers (listener, bridge, liveness monitor, scheduler, web) share the
/// root token. The store writer has its own token and stops last, so the
/// bridge can still hand over its final batch while shutting down.
pub struct Backbone {
    cancel: CancellationToken,
    store_cancel: CancellationToken,
    store: SignalStore,
    bridge: IngestBridge,
    dispatcher: Dispatcher,
    registry: ClientRegistry,
    schedules: Arc<Vec<String>>,
    listener_addr: Option<SocketAddr>,
    web_addr: Option<SocketAddr>,
    handles: Vec<JoinHandle<()>>,
    store_handle: JoinHandle<()>,
}

impl Backbone {
    pub async fn start(config: BackboneConfig) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let store_cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let (hot, archive) = open_backends(&config).await?;
        let (store, store_handle) =
            SignalStore::open(&config.store, hot, archive, store_cancel.clone()).await;

        let (bridge, bridge_handle) =
            IngestBridge::spawn(&config.ingest, store.clone(), cancel.clone());
        handles.push(bridge_handle);

        let announcer = HttpAnnouncer::new(config.dispatch.http_timeout())?;
        let dispatcher = Dispatcher::spawn(&config.dispatch, Arc::new(announcer), cancel.clone());

        let book = DestinationBook::from_lines(&config.destinations);
        let (registry, writers) = ClientRegistry::build(&book, &config.client_pairs(), local_now());
        event!(
            Level::INFO,
            destinations = book.len(),
            clients = registry.len(),
            "registrations loaded"
        );

        let monitor = LivenessMonitor::new(
            registry.clone(),
            writers,
            store.clone(),
            dispatcher.clone(),
            config.liveness.timeout_parameter.clone(),
        );
        handles.push(monitor.spawn(config.liveness.interval(), cancel.clone()));

        let scheduler = Scheduler::new(
            ScheduleTable::parse(&config.schedules),
            RedispatchJob::new(store.clone(), dispatcher.clone(), registry.clone()),
        );
        let schedules = Arc::new(scheduler.descriptions());
        handles.extend(scheduler.spawn(cancel.clone()));

        let mut listener_addr = None;
        if config.listener.enabled {
            let listener = SignalListener::bind(&config.listener, bridge.clone()).await?;
            listener_addr = Some(listener.local_addr()?);
            handles.push(listener.spawn(cancel.clone()));
        }

        let mut web_addr = None;
        if config.web.enabled {
            let addr = format!("{}:{}", config.web.host, config.web.port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| SignalError::IoError(format!("bind {}: {}", addr, e)))?;
            web_addr = Some(listener.local_addr()?);
            let app = build_router(WebState {
                store: store.clone(),
                bridge: bridge.clone(),
                dispatcher: dispatcher.clone(),
                schedules: schedules.clone(),
            });
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await;
                if let Err(err) = served {
                    event!(Level::ERROR, error = %err, "status endpoint failed");
                }
            }));
        }

        event!(
            Level::INFO,
            listener = ?listener_addr,
            web = ?web_addr,
            "backbone started"
        );

        Ok(Self {
            cancel,
            store_cancel,
            store,
            bridge,
            dispatcher,
            registry,
            schedules,
            listener_addr,
            web_addr,
            handles,
            store_handle,
        })
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub fn bridge(&self) -> &IngestBridge {
        &self.bridge
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn schedule_descriptions(&self) -> &[String] {
        &self.schedules
    }

    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_addr
    }

    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web_addr
    }

    /// Stops every loop. Running deliveries get `grace` to finish and are
    /// detached after that; the store drains its queue last.
    ///
    /// Returns the number of detached deliveries.
    pub async fn shutdown(self, grace: Duration) -> usize {
        event!(Level::INFO, "backbone shutting down");
        self.cancel.cancel();

        let detached = self.dispatcher.shutdown(grace).await;

        let stuck = match timeout(grace, join_all(self.handles)).await {
            Ok(results) => results.into_iter().filter(|r| r.is_err()).count(),
            Err(_) => {
                event!(Level::WARN, "background tasks did not stop within the grace period");
                0
            }
        };
        if stuck > 0 {
            event!(Level::WARN, tasks = stuck, "background tasks ended abnormally");
        }

        self.store_cancel.cancel();
        if timeout(grace, self.store_handle).await.is_err() {
            event!(Level::WARN, "store writer did not stop within the grace period");
        }

        event!(Level::INFO, detached = detached, "backbone stopped");
        detached
    }
}

async fn open_backends(
    config: &BackboneConfig,
) -> Result<(Arc<dyn MessageCollection>, Arc<dyn ArchiveProvider>)> {
    let Some(data_dir) = config.store.data_dir.as_ref() else {
        event!(Level::WARN, "no data_dir configured, records are kept in memory only");
        return Ok((
            Arc::new(MemoryCollection::new()),
            Arc::new(MemoryArchive::new()),
        ));
    };

    let mode = if config.store.sync_writes {
        DurabilityMode::Sync
    } else {
        DurabilityMode::Async
    };
    let threshold = config.store.checkpoint_threshold;
    let hot = FileCollection::open(data_dir.join(HOT_COLLECTION_DIR), mode, threshold).await?;
    let backup_root = config
        .store
        .resolved_backup_root()
        .unwrap_or_else(|| data_dir.join("_backup"));
    let archive = FileArchive::new(backup_root, mode, threshold);
    Ok((Arc::new(hot), Arc::new(archive)))
}
