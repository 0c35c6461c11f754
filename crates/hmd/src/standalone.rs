//! Standalone mode — every subsystem in one process on a [`LocalBus`].
//!
//! In this mode, the daemon:
//! 1. Opens the state store
//! 2. Answers credential requests from the configured credentials, if any
//! 3. Records heartbeats published on the heartbeat subject
//! 4. Polls the bulk API for desired state
//! 5. Runs analyzer ticks and reaps expired store entries
//! 6. Logs every start and stop published by the analyzer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hm_analyzer::{Analyzer, AnalyzerError, AnalyzerSettings, BackoffPolicy, HeartbeatBook};
use hm_core::{BusMessage, HmConfig, LocalBus, SystemClock};
use hm_fetcher::DesiredStateFetcher;
use hm_state::{Heartbeat, StartMessage, StateStore, StopMessage};

/// Open the store named by the configuration, creating its directory.
pub fn open_store(config: &HmConfig) -> anyhow::Result<StateStore> {
    if let Some(dir) = config.store_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = StateStore::open(&config.store_path, Arc::new(SystemClock))?;
    info!(path = ?config.store_path, "state store opened");
    Ok(store)
}

/// Run until Ctrl-C.
pub async fn run_standalone(config: HmConfig) -> anyhow::Result<()> {
    info!("HM daemon starting in standalone mode");

    let store = open_store(&config)?;
    let bus = LocalBus::new();
    let book = Arc::new(Mutex::new(HeartbeatBook::new()));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Bus listeners ──────────────────────────────────────────

    if let Some(handle) = spawn_credentials_responder(&config, &bus, shutdown_rx.clone()) {
        handles.push(handle);
    }
    handles.push(spawn_heartbeat_listener(
        &config,
        &bus,
        store.clone(),
        Arc::clone(&book),
        shutdown_rx.clone(),
    ));
    handles.push(spawn_action_logger(&config, &bus, shutdown_rx.clone()));

    // ── Desired state polling ──────────────────────────────────

    let fetcher = crate::build_fetcher(&config, &bus, &store);
    let polling_interval = Duration::from_secs(config.desired_state_polling_interval);
    handles.push(tokio::spawn(run_fetch_loop(
        fetcher,
        polling_interval,
        shutdown_rx.clone(),
    )));
    info!(interval = config.desired_state_polling_interval, "desired state fetcher started");

    // ── Analyzer ticks ─────────────────────────────────────────

    let analyzer = Analyzer::new(
        store.clone(),
        Arc::new(bus.clone()),
        BackoffPolicy::from_config(&config),
        AnalyzerSettings::from_config(&config),
    );
    let analyzer_interval = Duration::from_secs(config.analyzer_interval);
    let heartbeat_ttl = config.heartbeat_ttl;
    let mut analyzer_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(analyzer_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let heartbeats = book.lock().await.snapshot(store.now(), heartbeat_ttl);
                    match analyzer.evaluate(&heartbeats) {
                        Ok(_) => {}
                        Err(AnalyzerError::DesiredStateNotFresh) => {
                            debug!("desired state not fresh, skipping tick");
                        }
                        Err(e) => warn!(error = %e, "analyzer tick failed"),
                    }
                    match store.reap_expired() {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "reaped expired entries"),
                        Err(e) => warn!(error = %e, "store reaper error"),
                    }
                }
                _ = analyzer_shutdown.changed() => break,
            }
        }
    }));
    info!(interval = config.analyzer_interval, "analyzer started");

    // ── Wait for Ctrl-C ────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("HM daemon stopped");
    Ok(())
}

/// Poll desired state every `period`. Shutdown also abandons a cycle that is
/// still waiting on credentials or the bulk API.
async fn run_fetch_loop(
    fetcher: DesiredStateFetcher,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                tokio::select! {
                    result = fetcher.fetch_once() => {
                        if result.success {
                            debug!(stored = result.stored, "desired state poll complete");
                        } else {
                            warn!(message = %result.message, "desired state poll failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("fetch cycle abandoned on shutdown");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Serve the configured credentials on the auth subject. Returns `None` when
/// no credentials are configured.
pub fn spawn_credentials_responder(
    config: &HmConfig,
    bus: &LocalBus,
    shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let credentials = config.credentials.as_ref()?;
    let payload = match serde_json::to_vec(credentials) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode credentials, not serving them");
            return None;
        }
    };
    let requests = bus.subscribe(&config.auth_subject);
    info!(subject = %config.auth_subject, "serving bulk API credentials");

    Some(listen(requests, shutdown, move |msg| {
        if !msg.is_request() {
            return;
        }
        if let Err(e) = msg.respond(payload.clone()) {
            debug!(error = %e, "credentials requester went away");
        }
    }))
}

fn spawn_heartbeat_listener(
    config: &HmConfig,
    bus: &LocalBus,
    store: StateStore,
    book: Arc<Mutex<HeartbeatBook>>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut messages = bus.subscribe(&config.heartbeat_subject);
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = messages.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_slice::<Heartbeat>(&msg.payload) {
                        Ok(heartbeat) => {
                            debug!(
                                host_id = %heartbeat.host_id,
                                instances = heartbeat.instance_heartbeats.len(),
                                "heartbeat received"
                            );
                            book.lock().await.record(heartbeat, store.now());
                        }
                        Err(e) => warn!(error = %e, "dropping malformed heartbeat"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_action_logger(
    config: &HmConfig,
    bus: &LocalBus,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut starts = bus.subscribe(&config.start_subject);
    let mut stops = bus.subscribe(&config.stop_subject);
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = starts.recv() => {
                    match serde_json::from_slice::<StartMessage>(&msg.payload) {
                        Ok(start) => info!(
                            app_guid = %start.app_guid,
                            app_version = %start.app_version,
                            index = start.instance_index,
                            reason = ?start.reason,
                            "dispatch start"
                        ),
                        Err(e) => warn!(error = %e, "malformed start message"),
                    }
                }
                Some(msg) = stops.recv() => {
                    match serde_json::from_slice::<StopMessage>(&msg.payload) {
                        Ok(stop) => info!(
                            app_guid = %stop.app_guid,
                            app_version = %stop.app_version,
                            index = stop.instance_index,
                            instance_guid = %stop.instance_guid,
                            reason = ?stop.reason,
                            "dispatch stop"
                        ),
                        Err(e) => warn!(error = %e, "malformed stop message"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Feed every message to `handle` until shutdown or the bus goes away.
fn listen<F>(
    mut messages: mpsc::UnboundedReceiver<BusMessage>,
    mut shutdown: watch::Receiver<bool>,
    mut handle: F,
) -> JoinHandle<()>
where
    F: FnMut(BusMessage) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Some(msg) => handle(msg),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}
