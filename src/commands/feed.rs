use crate::error::AppError;
use crate::pulse::buckets::{bucketize, BucketView};
use crate::pulse::config::{FeedConfig, FeedSource, RecomputeMode, SimulatorConfig, StartFeedArgs};
use crate::pulse::pipeline::{self, refresh};
use crate::pulse::simulator::{now_unix_ms, SimulatedTokenSource, TokenSource};
use crate::pulse::types::{
    FilterPatch, SessionState, SessionStatusSnapshot, SortDirection, SortField, StorePerfSnapshot,
    StoreSnapshot, Token,
};
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedSessionInfo {
    pub source: &'static str,
    pub feed_url: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub recompute_mode: RecomputeMode,
    pub randomize_interval_ms: Option<u64>,
    pub seed: Option<u64>,
}

impl FeedSessionInfo {
    pub fn from_config(config: &FeedConfig) -> Self {
        let (source, feed_url) = match &config.source {
            FeedSource::Simulated => ("simulated", None),
            FeedSource::Remote { feed_url, .. } => ("remote", Some(feed_url.clone())),
        };
        Self {
            source,
            feed_url,
            max_reconnect_attempts: config.session.max_reconnect_attempts,
            reconnect_base_delay_ms: config.session.reconnect_base_delay.as_millis() as u64,
            recompute_mode: config.store.recompute_mode,
            randomize_interval_ms: config
                .randomize_interval
                .map(|interval| interval.as_millis() as u64),
            seed: config.simulator.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketViewsArgs {
    pub new_pairs: Option<BucketView>,
    pub final_stretch: Option<BucketView>,
    pub migrated: Option<BucketView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketsResponse {
    pub new_pairs: Vec<Token>,
    pub final_stretch: Vec<Token>,
    pub migrated: Vec<Token>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FaultArgs {
    pub drop_link: bool,
    pub refuse_connects: u32,
}

/// Starts a feed, replacing any running one. The slot stays locked until the
/// new handle is installed, so concurrent start/stop calls serialize.
pub async fn start_feed(
    state: &AppState,
    args: Option<StartFeedArgs>,
) -> Result<FeedSessionInfo, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let mut feed_slot = state.feed.lock().await;
    if let Some(handle) = feed_slot.take() {
        handle.shutdown().await;
    }

    let handle = pipeline::start_feed(
        config.clone(),
        state.store.clone(),
        Arc::clone(&state.feed_status),
    )
    .await?;
    *feed_slot = Some(handle);
    drop(feed_slot);

    let session = FeedSessionInfo::from_config(&config);
    info!(source = session.source, "feed started");
    Ok(session)
}

pub async fn stop_feed(state: &AppState) -> Result<FeedStopResult, AppError> {
    let mut feed_slot = state.feed.lock().await;
    let stopped = if let Some(handle) = feed_slot.take() {
        handle.shutdown().await;
        true
    } else {
        false
    };

    {
        let mut writable = state.feed_status.write();
        let events_received = writable.events_received;
        *writable = SessionStatusSnapshot {
            state: SessionState::Disconnected,
            reconnect_attempt: 0,
            events_received,
            reason: Some("feed stopped by command".to_string()),
        };
    }
    drop(feed_slot);

    Ok(FeedStopResult { stopped })
}

pub async fn feed_status(state: &AppState) -> Result<SessionStatusSnapshot, AppError> {
    if let Some(handle) = state.feed.lock().await.as_ref() {
        let snapshot = handle.status();
        *state.feed_status.write() = snapshot.clone();
        return Ok(snapshot);
    }
    let snapshot = state.feed_status.read().clone();
    Ok(snapshot)
}

/// Reloads the full token set from the running feed's snapshot source. With
/// no feed running the simulated source is used.
pub async fn refresh_tokens(state: &AppState) -> Result<RefreshResult, AppError> {
    let source: Arc<dyn TokenSource> = {
        let feed_slot = state.feed.lock().await;
        match feed_slot.as_ref() {
            Some(handle) => handle.token_source().ok_or_else(|| {
                AppError::InvalidArgument(
                    "remote feed has no snapshotUrl configured".to_string(),
                )
            })?,
            None => Arc::new(SimulatedTokenSource::new(SimulatorConfig::default())),
        }
    };

    let count = refresh(source.as_ref(), &state.store).await?;
    Ok(RefreshResult { count })
}

pub fn set_filters(state: &AppState, patch: FilterPatch) -> Result<StoreSnapshot, AppError> {
    state.store.set_filters(patch);
    state.store.recompute_projection();
    Ok(state.store.snapshot())
}

pub fn sort_tokens(
    state: &AppState,
    field: SortField,
    direction: SortDirection,
) -> Result<StoreSnapshot, AppError> {
    state.store.sort(field, direction);
    Ok(state.store.snapshot())
}

pub fn store_snapshot(state: &AppState) -> StoreSnapshot {
    state.store.snapshot()
}

pub fn store_perf(state: &AppState) -> StorePerfSnapshot {
    state.store.perf_snapshot(now_unix_ms())
}

pub fn token_buckets(state: &AppState, args: Option<BucketViewsArgs>) -> BucketsResponse {
    let views = args.unwrap_or_default();
    let buckets = state.store.read(|readable| bucketize(readable.projection()));

    BucketsResponse {
        new_pairs: views.new_pairs.unwrap_or_default().top(&buckets.new_pairs),
        final_stretch: views
            .final_stretch
            .unwrap_or_default()
            .top(&buckets.final_stretch),
        migrated: views.migrated.unwrap_or_default().top(&buckets.migrated),
    }
}

pub async fn inject_fault(state: &AppState, args: FaultArgs) -> Result<(), AppError> {
    let feed_slot = state.feed.lock().await;
    let faults = feed_slot
        .as_ref()
        .and_then(|handle| handle.faults())
        .ok_or_else(|| {
            AppError::InvalidArgument(
                "fault injection requires a running simulated feed".to_string(),
            )
        })?;

    if args.refuse_connects > 0 {
        faults.refuse_next_connects(args.refuse_connects);
    }
    if args.drop_link {
        faults.drop_link();
    }
    info!(
        drop_link = args.drop_link,
        refuse_connects = args.refuse_connects,
        "fault injected"
    );
    Ok(())
}
