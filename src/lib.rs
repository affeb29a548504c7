pub mod commands;
pub mod error;
pub mod logging;
pub mod pulse;
pub mod state;

use commands::{
    app_info::app_info,
    feed::{refresh_tokens, start_feed, stop_feed, token_buckets},
    health::health,
};
use error::AppError;
use pulse::config::StartFeedArgs;
use state::AppState;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const SUMMARY_INTERVAL_SECS: u64 = 5;

/// Runs a feed headless until ctrl-c, logging a store summary periodically.
pub async fn run(args: StartFeedArgs) -> Result<(), AppError> {
    let info = app_info();
    info!(
        product = %info.product_name,
        version = %info.version,
        platform = %info.platform,
        arch = %info.arch,
        "starting"
    );

    let state = AppState::default();
    let wants_snapshot = args.snapshot_url.is_some();

    let session = start_feed(&state, Some(args)).await?;
    info!(
        source = session.source,
        feed_url = session.feed_url.as_deref().unwrap_or("simulated"),
        max_reconnect_attempts = session.max_reconnect_attempts,
        "token pulse running"
    );
    if wants_snapshot {
        if let Err(error) = refresh_tokens(&state).await {
            warn!("initial snapshot fetch failed: {error}");
        }
    }

    let mut summary = tokio::time::interval(Duration::from_secs(SUMMARY_INTERVAL_SECS));
    summary.set_missed_tick_behavior(MissedTickBehavior::Skip);
    summary.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown requested");
                break;
            }
            _ = summary.tick() => {
                let report = health(&state);
                let buckets = token_buckets(&state, None);
                info!(
                    session = ?report.session,
                    entities = report.entities,
                    projection = report.projection,
                    new_pairs = buckets.new_pairs.len(),
                    final_stretch = buckets.final_stretch.len(),
                    migrated = buckets.migrated.len(),
                    "store summary"
                );
            }
        }
    }

    stop_feed(&state).await?;
    Ok(())
}
