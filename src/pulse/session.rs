use crate::error::AppError;
use crate::pulse::config::SessionConfig;
use crate::pulse::types::{FeedEvent, SessionState, SessionStatusSnapshot};
use crate::pulse::{
    CONNECTED_EVENT, DISCONNECTED_EVENT, ERROR_EVENT, INITIAL_DATA_EVENT, NEW_TOKEN_EVENT,
    PRICE_UPDATE_EVENT, RECONNECTING_EVENT, TOKEN_REMOVED_EVENT,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_EXPONENT: u32 = 20;

/// One established link: data events in receipt order, ending when the link drops.
pub type FeedLink = BoxStream<'static, Result<FeedEvent, AppError>>;

#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<FeedLink, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedEventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    InitialData,
    PriceUpdate,
    NewToken,
    TokenRemoved,
}

impl FeedEventKind {
    pub const ALL: [FeedEventKind; 8] = [
        Self::Connected,
        Self::Disconnected,
        Self::Reconnecting,
        Self::Error,
        Self::InitialData,
        Self::PriceUpdate,
        Self::NewToken,
        Self::TokenRemoved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => CONNECTED_EVENT,
            Self::Disconnected => DISCONNECTED_EVENT,
            Self::Reconnecting => RECONNECTING_EVENT,
            Self::Error => ERROR_EVENT,
            Self::InitialData => INITIAL_DATA_EVENT,
            Self::PriceUpdate => PRICE_UPDATE_EVENT,
            Self::NewToken => NEW_TOKEN_EVENT,
            Self::TokenRemoved => TOKEN_REMOVED_EVENT,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Error { message: String },
    Feed(FeedEvent),
}

impl SessionEvent {
    pub fn kind(&self) -> FeedEventKind {
        match self {
            Self::Connected => FeedEventKind::Connected,
            Self::Disconnected { .. } => FeedEventKind::Disconnected,
            Self::Reconnecting { .. } => FeedEventKind::Reconnecting,
            Self::Error { .. } => FeedEventKind::Error,
            Self::Feed(FeedEvent::InitialData(_)) => FeedEventKind::InitialData,
            Self::Feed(FeedEvent::PriceUpdate(_)) => FeedEventKind::PriceUpdate,
            Self::Feed(FeedEvent::NewToken(_)) => FeedEventKind::NewToken,
            Self::Feed(FeedEvent::TokenRemoved(_)) => FeedEventKind::TokenRemoved,
        }
    }
}

pub type ListenerId = u64;
type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct SessionRuntime {
    generation: u64,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

struct SessionInner<C> {
    connector: C,
    config: SessionConfig,
    listeners: RwLock<HashMap<FeedEventKind, Vec<(ListenerId, Listener)>>>,
    next_listener_id: AtomicU64,
    // Held for reading while listeners run; teardown takes it for writing.
    dispatch_gate: RwLock<()>,
    status: RwLock<SessionStatusSnapshot>,
    events_received: AtomicU64,
    generation: AtomicU64,
    runtime: Mutex<Option<SessionRuntime>>,
}

impl<C> SessionInner<C> {
    fn dispatch(&self, event: &SessionEvent, cancel: &CancellationToken) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, listener)| Arc::clone(listener)).collect())
            .unwrap_or_default();
        if listeners.is_empty() {
            return;
        }

        let _gate = self.dispatch_gate.read();
        if cancel.is_cancelled() {
            return;
        }
        for listener in listeners {
            listener(event);
        }
    }

    fn snapshot(&self) -> SessionStatusSnapshot {
        let mut snapshot = self.status.read().clone();
        snapshot.events_received = self.events_received.load(Ordering::Relaxed);
        snapshot
    }

    fn set_status(&self, state: SessionState, reconnect_attempt: u32, reason: Option<String>) {
        let mut writable = self.status.write();
        writable.state = state;
        writable.reconnect_attempt = reconnect_attempt;
        writable.reason = reason;
    }
}

/// Owned transport session. Cloning shares the same connection and listeners.
///
/// Listeners run synchronously on the task that received the event and must
/// not call back into `disconnect`.
pub struct FeedSession<C: FeedConnector> {
    inner: Arc<SessionInner<C>>,
}

impl<C: FeedConnector> Clone for FeedSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: FeedConnector> FeedSession<C> {
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                connector,
                config,
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                dispatch_gate: RwLock::new(()),
                status: RwLock::new(SessionStatusSnapshot::disconnected(None)),
                events_received: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn on(
        &self,
        kind: FeedEventKind,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes every listener registered for `kind`.
    pub fn off(&self, kind: FeedEventKind) -> usize {
        self.inner
            .listeners
            .write()
            .remove(&kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut writable = self.inner.listeners.write();
        for entries in writable.values_mut() {
            if let Some(index) = entries.iter().position(|(entry_id, _)| *entry_id == id) {
                entries.remove(index);
                return true;
            }
        }
        false
    }

    pub fn status(&self) -> SessionStatusSnapshot {
        self.inner.snapshot()
    }

    /// Status reader that does not keep the session alive; safe to capture
    /// inside the session's own listeners.
    pub fn status_reader(
        &self,
    ) -> impl Fn() -> Option<SessionStatusSnapshot> + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || inner.upgrade().map(|inner| inner.snapshot())
    }

    /// Resolves once the link is up. A no-op while a session is already live;
    /// a failed first attempt is returned to the caller and not retried.
    pub async fn connect(&self) -> Result<(), AppError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = {
            let mut runtime = self.inner.runtime.lock();
            if runtime
                .as_ref()
                .is_some_and(|existing| !existing.cancel.is_cancelled())
            {
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *runtime = Some(SessionRuntime {
                generation,
                cancel: cancel.clone(),
                pump: None,
            });
            cancel
        };

        self.inner
            .set_status(SessionState::Connecting, 0, Some("opening feed link".to_string()));
        info!("connecting feed session");

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled("connect aborted by disconnect".to_string())),
            result = self.inner.connector.connect() => result,
        };

        let link = match result {
            Ok(link) => link,
            Err(error) => {
                {
                    let mut runtime = self.inner.runtime.lock();
                    if runtime
                        .as_ref()
                        .is_some_and(|existing| existing.generation == generation)
                    {
                        runtime.take();
                    }
                }
                if cancel.is_cancelled() {
                    return Err(error);
                }
                warn!("feed connect failed: {error}");
                self.inner.set_status(
                    SessionState::Disconnected,
                    0,
                    Some(format!("connect failed: {error}")),
                );
                self.inner.dispatch(
                    &SessionEvent::Error {
                        message: error.to_string(),
                    },
                    &cancel,
                );
                cancel.cancel();
                return Err(error);
            }
        };

        self.inner
            .set_status(SessionState::Connected, 0, Some("feed link established".to_string()));
        info!("feed session connected");
        self.inner.dispatch(&SessionEvent::Connected, &cancel);

        let mut runtime = self.inner.runtime.lock();
        match runtime.as_mut() {
            Some(existing) if existing.generation == generation && !cancel.is_cancelled() => {
                existing.pump = Some(tokio::spawn(run_pump(
                    Arc::clone(&self.inner),
                    link,
                    cancel.clone(),
                )));
                Ok(())
            }
            _ => Err(AppError::Cancelled(
                "session disconnected while connecting".to_string(),
            )),
        }
    }

    /// Stops the link and every pending timer. Once this returns no listener
    /// is invoked for this connection. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let Some(runtime) = self.inner.runtime.lock().take() else {
            return;
        };
        runtime.cancel.cancel();
        if let Some(pump) = runtime.pump {
            pump.abort();
        }
        drop(self.inner.dispatch_gate.write());

        let previous = self.inner.status.read().state;
        if previous != SessionState::Failed {
            self.inner.set_status(
                SessionState::Disconnected,
                0,
                Some("disconnected by caller".to_string()),
            );
        }
        info!(?previous, "feed session torn down");
    }
}

pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(MAX_BACKOFF_EXPONENT))
}

async fn run_pump<C: FeedConnector>(
    inner: Arc<SessionInner<C>>,
    mut link: FeedLink,
    cancel: CancellationToken,
) {
    loop {
        let reason = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = link.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    inner.events_received.fetch_add(1, Ordering::Relaxed);
                    debug!(kind = event_kind_name(&event), "feed event received");
                    inner.dispatch(&SessionEvent::Feed(event), &cancel);
                }
                Some(Err(error)) if error.is_data_error() => {
                    warn!("skipping undecodable feed event: {error}");
                    inner.dispatch(
                        &SessionEvent::Error {
                            message: error.to_string(),
                        },
                        &cancel,
                    );
                }
                Some(Err(error)) => break error.to_string(),
                None => break "feed link closed".to_string(),
            }
        };

        warn!("feed link lost: {reason}");
        inner.set_status(SessionState::Disconnected, 0, Some(reason.clone()));
        inner.dispatch(&SessionEvent::Disconnected { reason }, &cancel);

        let mut reconnect_attempt = 0_u32;
        link = loop {
            reconnect_attempt = reconnect_attempt.saturating_add(1);
            if reconnect_attempt > inner.config.max_reconnect_attempts {
                let message = AppError::ConnectionFailed(format!(
                    "gave up after {} reconnect attempts",
                    inner.config.max_reconnect_attempts
                ))
                .to_string();
                error!("{message}");
                inner.set_status(
                    SessionState::Failed,
                    inner.config.max_reconnect_attempts,
                    Some(message.clone()),
                );
                inner.dispatch(&SessionEvent::Error { message }, &cancel);
                cancel.cancel();
                return;
            }

            let delay = backoff_delay(inner.config.reconnect_base_delay, reconnect_attempt);
            inner.set_status(
                SessionState::Reconnecting,
                reconnect_attempt,
                Some(format!("reconnect attempt {reconnect_attempt}")),
            );
            info!(attempt = reconnect_attempt, ?delay, "scheduling feed reconnect");
            inner.dispatch(
                &SessionEvent::Reconnecting {
                    attempt: reconnect_attempt,
                    delay,
                },
                &cancel,
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = inner.connector.connect() => result,
            };
            match result {
                Ok(next_link) => break next_link,
                Err(error) => {
                    warn!(attempt = reconnect_attempt, "feed reconnect failed: {error}");
                    inner.set_status(
                        SessionState::Reconnecting,
                        reconnect_attempt,
                        Some(format!("reconnect attempt {reconnect_attempt} failed: {error}")),
                    );
                }
            }
        };

        inner.set_status(SessionState::Connected, 0, Some("feed link re-established".to_string()));
        info!("feed session reconnected");
        inner.dispatch(&SessionEvent::Connected, &cancel);
    }
}

fn event_kind_name(event: &FeedEvent) -> &'static str {
    match event {
        FeedEvent::InitialData(_) => INITIAL_DATA_EVENT,
        FeedEvent::PriceUpdate(_) => PRICE_UPDATE_EVENT,
        FeedEvent::NewToken(_) => NEW_TOKEN_EVENT,
        FeedEvent::TokenRemoved(_) => TOKEN_REMOVED_EVENT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    type Step = Option<Vec<Result<FeedEvent, AppError>>>;

    struct ScriptedConnector {
        script: Mutex<VecDeque<Step>>,
        hold_open: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<Step>, hold_open: bool) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    script: Mutex::new(steps.into()),
                    hold_open,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn connect(&self) -> Result<FeedLink, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().pop_front().flatten();
            let Some(items) = step else {
                return Err(AppError::Transport("connection refused".to_string()));
            };
            let items = stream::iter(items);
            let link: FeedLink = if self.hold_open {
                items.chain(stream::pending()).boxed()
            } else {
                items.boxed()
            };
            Ok(link)
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(10),
        }
    }

    fn removal(id: &str) -> FeedEvent {
        FeedEvent::TokenRemoved(id.to_string())
    }

    async fn wait_for_state<C: FeedConnector>(session: &FeedSession<C>, state: SessionState) {
        for _ in 0..2_000 {
            if session.status().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {state:?}");
    }

    fn record(
        session: &FeedSession<ScriptedConnector>,
        kind: FeedEventKind,
    ) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.on(kind, move |event| sink.lock().push(event.clone()));
        seen
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(32));
    }

    #[test]
    fn event_names_round_trip() {
        for kind in FeedEventKind::ALL {
            assert_eq!(FeedEventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(FeedEventKind::from_name("order_book"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_fail_permanently() {
        let (connector, calls) = ScriptedConnector::new(
            vec![Some(vec![Ok(removal("x"))]), None, None, None, None, None],
            false,
        );
        let session = FeedSession::new(connector, fast_config());
        let errors = record(&session, FeedEventKind::Error);

        session.connect().await.expect("first connect succeeds");
        wait_for_state(&session, SessionState::Failed).await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(errors.lock().len(), 1);
        assert!(matches!(
            &errors.lock()[0],
            SessionEvent::Error { message } if message.contains("after 5 reconnect attempts")
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(session.status().state, SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempt_counter() {
        let (connector, calls) = ScriptedConnector::new(
            vec![
                Some(Vec::new()),
                None,
                None,
                Some(Vec::new()),
                None,
                None,
                None,
                None,
                None,
            ],
            false,
        );
        let session = FeedSession::new(connector, fast_config());
        let attempts = record(&session, FeedEventKind::Reconnecting);
        let connected = record(&session, FeedEventKind::Connected);

        session.connect().await.expect("first connect succeeds");
        wait_for_state(&session, SessionState::Failed).await;

        assert_eq!(calls.load(Ordering::SeqCst), 9);
        assert_eq!(connected.lock().len(), 2);
        let observed: Vec<u32> = attempts
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Reconnecting { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(observed, vec![1, 2, 3, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_connect_is_not_retried() {
        let (connector, calls) = ScriptedConnector::new(vec![None], false);
        let session = FeedSession::new(connector, fast_config());
        let errors = record(&session, FeedEventKind::Error);

        assert!(session.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(session.status().state, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_events_are_skipped_in_order() {
        let (connector, _) = ScriptedConnector::new(
            vec![Some(vec![
                Ok(removal("a")),
                Err(AppError::MalformedEvent("bad frame".to_string())),
                Ok(removal("b")),
            ])],
            true,
        );
        let session = FeedSession::new(connector, fast_config());
        let removals = record(&session, FeedEventKind::TokenRemoved);
        let errors = record(&session, FeedEventKind::Error);

        session.connect().await.expect("connect succeeds");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *removals.lock(),
            vec![SessionEvent::Feed(removal("a")), SessionEvent::Feed(removal("b"))]
        );
        assert_eq!(errors.lock().len(), 1);
        let status = session.status();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.events_received, 2);
        session.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_silences_listeners_and_is_idempotent() {
        let (connector, calls) =
            ScriptedConnector::new(vec![Some(vec![Ok(removal("a"))])], true);
        let session = FeedSession::new(connector, fast_config());
        let removals = record(&session, FeedEventKind::TokenRemoved);
        let disconnects = record(&session, FeedEventKind::Disconnected);

        session.connect().await.expect("connect succeeds");
        session.connect().await.expect("second connect is a no-op");
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.disconnect();
        session.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(removals.lock().len(), 1);
        assert!(disconnects.lock().is_empty());
        assert_eq!(session.status().state, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_listeners_and_selective_removal() {
        let (connector, _) = ScriptedConnector::new(
            vec![Some(vec![Ok(removal("a"))]), Some(vec![Ok(removal("b"))])],
            true,
        );
        let session = FeedSession::new(connector, fast_config());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_sink = Arc::clone(&first);
        let second_sink = Arc::clone(&second);
        let first_id = session.on(FeedEventKind::TokenRemoved, move |_| {
            first_sink.fetch_add(1, Ordering::SeqCst);
        });
        session.on(FeedEventKind::TokenRemoved, move |_| {
            second_sink.fetch_add(1, Ordering::SeqCst);
        });

        session.connect().await.expect("connect succeeds");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(session.remove_listener(first_id));
        assert!(!session.remove_listener(first_id));
        assert_eq!(session.off(FeedEventKind::TokenRemoved), 1);
        assert_eq!(session.off(FeedEventKind::TokenRemoved), 0);
        session.disconnect();
    }
}
