use crate::error::AppError;
use crate::pulse::config::{FeedConfig, FeedSource, RecomputeMode};
use crate::pulse::session::{FeedConnector, FeedEventKind, FeedSession, SessionEvent};
use crate::pulse::simulator::{
    jitter_payload, now_unix_ms, seeded_rng, FaultHandle, SimulatedConnector, SimulatedTokenSource,
    TokenSource,
};
use crate::pulse::store::{ApplyOutcome, SharedTokenStore};
use crate::pulse::types::{FeedEvent, SessionState, SessionStatusSnapshot};
use crate::pulse::websocket::{HttpTokenSource, WebSocketConnector};
use parking_lot::RwLock;
use rand::Rng;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 2_000;

pub type StatusStore = Arc<RwLock<SessionStatusSnapshot>>;

/// Type-erased control surface over a running session.
pub trait SessionControl: Send + Sync {
    fn status(&self) -> SessionStatusSnapshot;
    fn disconnect(&self);
}

impl<C: FeedConnector> SessionControl for FeedSession<C> {
    fn status(&self) -> SessionStatusSnapshot {
        FeedSession::status(self)
    }

    fn disconnect(&self) {
        FeedSession::disconnect(self);
    }
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<SessionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

/// Repeated reconnecting/failed reports with the same reason are logged at
/// most once per throttle window.
fn allow_status_publish(
    throttle: &mut StatusPublishThrottle,
    snapshot: &SessionStatusSnapshot,
    now: Instant,
) -> bool {
    if throttle.last_state == Some(snapshot.state) && throttle.last_reason == snapshot.reason {
        let noisy = matches!(
            snapshot.state,
            SessionState::Reconnecting | SessionState::Failed
        );
        let recent = throttle
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false);
        if !noisy || recent {
            return false;
        }
    }

    throttle.last_state = Some(snapshot.state);
    throttle.last_reason = snapshot.reason.clone();
    throttle.last_emit = Some(now);
    true
}

fn publish_status(status_store: &StatusStore, snapshot: SessionStatusSnapshot) {
    *status_store.write() = snapshot;
}

/// Routes session events into store mutations. Every mutation goes through
/// the shared store's single lock, in receipt order.
pub fn attach_store<C: FeedConnector>(
    session: &FeedSession<C>,
    store: &SharedTokenStore,
    status_store: &StatusStore,
) {
    let target = store.clone();
    session.on(FeedEventKind::InitialData, move |event| {
        if let SessionEvent::Feed(FeedEvent::InitialData(payloads)) = event {
            let outcome = target.apply_initial(payloads.clone());
            debug!(?outcome, "initial_data applied");
        }
    });

    let target = store.clone();
    session.on(FeedEventKind::PriceUpdate, move |event| {
        if let SessionEvent::Feed(FeedEvent::PriceUpdate(update)) = event {
            log_outcome("price_update", target.apply_price_update(update.clone()));
        }
    });

    let target = store.clone();
    session.on(FeedEventKind::NewToken, move |event| {
        if let SessionEvent::Feed(FeedEvent::NewToken(payload)) = event {
            log_outcome("new_token", target.apply_upsert(payload.clone()));
        }
    });

    let target = store.clone();
    session.on(FeedEventKind::TokenRemoved, move |event| {
        if let SessionEvent::Feed(FeedEvent::TokenRemoved(id)) = event {
            log_outcome("token_removed", target.apply_remove(id));
        }
    });

    let target = store.clone();
    session.on(FeedEventKind::Error, move |event| {
        if let SessionEvent::Error { message } = event {
            target.record_transport_error(message.clone());
        }
    });

    let target = store.clone();
    session.on(FeedEventKind::Disconnected, move |event| {
        if let SessionEvent::Disconnected { reason } = event {
            target.record_transport_error(format!("connection lost: {reason}"));
        }
    });

    let target = store.clone();
    session.on(FeedEventKind::Connected, move |_| {
        target.clear_error();
    });

    for kind in [
        FeedEventKind::Connected,
        FeedEventKind::Disconnected,
        FeedEventKind::Reconnecting,
        FeedEventKind::Error,
    ] {
        let read_status = session.status_reader();
        let lifecycle_status = Arc::clone(status_store);
        session.on(kind, move |_| {
            if let Some(snapshot) = read_status() {
                publish_status(&lifecycle_status, snapshot);
            }
        });
    }
}

fn log_outcome(kind: &str, outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Rejected { reason } => warn!(kind, "feed event rejected: {reason}"),
        ApplyOutcome::Stale { incoming, current } => {
            debug!(kind, incoming, current, "stale feed event skipped")
        }
        other => debug!(kind, outcome = ?other, "feed event applied"),
    }
}

/// Periodically nudges one random token through the store's mutation entry point.
pub fn spawn_randomizer(
    store: SharedTokenStore,
    interval: Duration,
    seed: Option<u64>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = seeded_rng(seed.map(|seed| seed.wrapping_add(2)));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = store.mutate(|writable| {
                        if writable.is_empty() {
                            return ApplyOutcome::Ignored { reason: "no tokens to randomize" };
                        }
                        let index = rng.gen_range(0..writable.len());
                        let Some(token) = writable.entity_at(index) else {
                            return ApplyOutcome::Ignored { reason: "no tokens to randomize" };
                        };
                        let payload = jitter_payload(&mut rng, token, now_unix_ms());
                        writable.apply_upsert(payload)
                    });
                    debug!(?outcome, "randomizer tick");
                }
            }
        }
    })
}

/// Deferred-mode recompute: at most one projection rebuild per tick.
pub fn spawn_recompute_ticker(
    store: SharedTokenStore,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    store.flush();
                }
            }
        }
    })
}

pub fn spawn_heartbeat(
    session: Arc<dyn SessionControl>,
    store: SharedTokenStore,
    status_store: StatusStore,
    perf_telemetry: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut throttle = StatusPublishThrottle::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = session.status();
                    if allow_status_publish(&mut throttle, &snapshot, Instant::now()) {
                        info!(
                            state = ?snapshot.state,
                            attempt = snapshot.reconnect_attempt,
                            events = snapshot.events_received,
                            reason = snapshot.reason.as_deref().unwrap_or(""),
                            "feed session status"
                        );
                    }
                    publish_status(&status_store, snapshot);

                    if perf_telemetry {
                        let perf = store.perf_snapshot(now_unix_ms());
                        info!(
                            apply_p50_us = perf.apply_p50_us,
                            apply_p95_us = perf.apply_p95_us,
                            apply_p99_us = perf.apply_p99_us,
                            recompute_p50_us = perf.recompute_p50_us,
                            recompute_p95_us = perf.recompute_p95_us,
                            recompute_p99_us = perf.recompute_p99_us,
                            apply_count = perf.apply_count,
                            recompute_count = perf.recompute_count,
                            "store perf"
                        );
                    }
                }
            }
        }
    })
}

/// Fetches a fresh initial set. Failure keeps the current data and marks the
/// store as errored.
pub async fn refresh(
    source: &dyn TokenSource,
    store: &SharedTokenStore,
) -> Result<usize, AppError> {
    store.begin_loading();
    match source.fetch_tokens().await {
        Ok(payloads) => {
            let outcome = store.apply_initial(payloads);
            let count = store.read(|readable| readable.len());
            info!(count, ?outcome, "token set refreshed");
            Ok(count)
        }
        Err(error) => {
            warn!("token refresh failed: {error}");
            store.fail_loading(error.to_string());
            Err(error)
        }
    }
}

pub struct FeedHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    session: Arc<dyn SessionControl>,
    token_source: Option<Arc<dyn TokenSource>>,
    faults: Option<FaultHandle>,
    config: FeedConfig,
}

impl FeedHandle {
    pub fn status(&self) -> SessionStatusSnapshot {
        self.session.status()
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn token_source(&self) -> Option<Arc<dyn TokenSource>> {
        self.token_source.clone()
    }

    pub fn faults(&self) -> Option<&FaultHandle> {
        self.faults.as_ref()
    }

    /// Tears the session down first so no feed event lands after the timers stop.
    pub async fn shutdown(self) {
        self.session.disconnect();
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("feed runtime stopped");
    }
}

fn token_source_for(config: &FeedConfig) -> Option<Arc<dyn TokenSource>> {
    match &config.source {
        FeedSource::Simulated => Some(Arc::new(SimulatedTokenSource::new(config.simulator))),
        FeedSource::Remote {
            snapshot_url: Some(url),
            ..
        } => Some(Arc::new(HttpTokenSource::new(Client::new(), url.clone()))),
        FeedSource::Remote {
            snapshot_url: None,
            ..
        } => None,
    }
}

pub async fn start_feed(
    config: FeedConfig,
    store: SharedTokenStore,
    status_store: StatusStore,
) -> Result<FeedHandle, AppError> {
    store.reconfigure(config.store);
    match config.source.clone() {
        FeedSource::Simulated => {
            let connector = SimulatedConnector::new(config.simulator);
            let faults = connector.fault_handle();
            run_with_connector(connector, Some(faults), config, store, status_store).await
        }
        FeedSource::Remote { feed_url, .. } => {
            let connector = WebSocketConnector::new(feed_url);
            run_with_connector(connector, None, config, store, status_store).await
        }
    }
}

pub async fn run_with_connector<C: FeedConnector>(
    connector: C,
    faults: Option<FaultHandle>,
    config: FeedConfig,
    store: SharedTokenStore,
    status_store: StatusStore,
) -> Result<FeedHandle, AppError> {
    let session = FeedSession::new(connector, config.session);
    attach_store(&session, &store, &status_store);
    let control: Arc<dyn SessionControl> = Arc::new(session.clone());

    let cancel = CancellationToken::new();
    let mut tasks = vec![spawn_heartbeat(
        Arc::clone(&control),
        store.clone(),
        Arc::clone(&status_store),
        config.perf_telemetry,
        cancel.clone(),
    )];
    if let Some(interval) = config.randomize_interval {
        tasks.push(spawn_randomizer(
            store.clone(),
            interval,
            config.simulator.seed,
            cancel.clone(),
        ));
    }
    if config.store.recompute_mode == RecomputeMode::Deferred {
        tasks.push(spawn_recompute_ticker(
            store.clone(),
            config.recompute_interval,
            cancel.clone(),
        ));
    }

    if let Err(error) = session.connect().await {
        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }
        publish_status(&status_store, session.status());
        return Err(error);
    }
    publish_status(&status_store, session.status());

    Ok(FeedHandle {
        cancel,
        tasks,
        session: control,
        token_source: token_source_for(&config),
        faults,
        config,
    })
}
