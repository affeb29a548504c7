use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "PULSE_CONFIG";
pub const FEED_URL_ENV: &str = "PULSE_FEED_URL";
pub const SNAPSHOT_URL_ENV: &str = "PULSE_SNAPSHOT_URL";
pub const SEED_ENV: &str = "PULSE_SEED";

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 100;
pub const DEFAULT_INITIAL_DATA_DELAY_MS: u64 = 200;
pub const DEFAULT_INITIAL_TOKEN_COUNT: usize = 50;
pub const DEFAULT_BURST_INTERVAL_MIN_MS: u64 = 800;
pub const DEFAULT_BURST_INTERVAL_MAX_MS: u64 = 1_500;
pub const DEFAULT_BURST_SIZE_MIN: usize = 2;
pub const DEFAULT_BURST_SIZE_MAX: usize = 4;
pub const DEFAULT_BURST_STAGGER_MS: u64 = 200;
pub const DEFAULT_RANDOMIZE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECOMPUTE_INTERVAL_MS: u64 = 16;
pub const DEFAULT_FETCH_DELAY_MS: u64 = 500;
pub const DEFAULT_PERF_TELEMETRY: bool = false;
pub const MIN_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 20;
pub const MIN_RECONNECT_BASE_DELAY_MS: u64 = 10;
pub const MAX_RECONNECT_BASE_DELAY_MS: u64 = 60_000;
pub const MAX_STARTUP_DELAY_MS: u64 = 10_000;
pub const MIN_INITIAL_TOKEN_COUNT: usize = 1;
pub const MAX_INITIAL_TOKEN_COUNT: usize = 5_000;
pub const MIN_BURST_INTERVAL_MS: u64 = 50;
pub const MAX_BURST_INTERVAL_MS: u64 = 60_000;
pub const MIN_BURST_SIZE: usize = 1;
pub const MAX_BURST_SIZE: usize = 64;
pub const MIN_RANDOMIZE_INTERVAL_MS: u64 = 100;
pub const MAX_RANDOMIZE_INTERVAL_MS: u64 = 60_000;
pub const MIN_RECOMPUTE_INTERVAL_MS: u64 = 8;
pub const MAX_RECOMPUTE_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecomputeMode {
    /// Every mutating call returns with an up-to-date projection.
    #[default]
    Eager,
    /// Mutations mark the projection dirty; a ticker recomputes.
    Deferred,
}

/// What to do with an event whose timestamp is older than the stored one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    #[default]
    Reject,
    Clamp,
    Accept,
}

/// What to do with a price update for an id the store does not hold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedUpdatePolicy {
    #[default]
    Drop,
    Retarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedArgs {
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub connect_delay_ms: Option<u64>,
    pub initial_data_delay_ms: Option<u64>,
    pub initial_token_count: Option<usize>,
    pub burst_interval_min_ms: Option<u64>,
    pub burst_interval_max_ms: Option<u64>,
    pub burst_size_min: Option<usize>,
    pub burst_size_max: Option<usize>,
    pub burst_stagger_ms: Option<u64>,
    pub randomize_interval_ms: Option<u64>,
    pub recompute_mode: Option<RecomputeMode>,
    pub recompute_interval_ms: Option<u64>,
    pub timestamp_policy: Option<TimestampPolicy>,
    pub unmatched_update_policy: Option<UnmatchedUpdatePolicy>,
    pub perf_telemetry: Option<bool>,
    pub fetch_delay_ms: Option<u64>,
    pub feed_url: Option<String>,
    pub snapshot_url: Option<String>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorConfig {
    pub connect_delay: Duration,
    pub initial_data_delay: Duration,
    pub initial_token_count: usize,
    pub burst_interval_min: Duration,
    pub burst_interval_max: Duration,
    pub burst_size_min: usize,
    pub burst_size_max: usize,
    pub burst_stagger: Duration,
    pub fetch_delay: Duration,
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_millis(DEFAULT_CONNECT_DELAY_MS),
            initial_data_delay: Duration::from_millis(DEFAULT_INITIAL_DATA_DELAY_MS),
            initial_token_count: DEFAULT_INITIAL_TOKEN_COUNT,
            burst_interval_min: Duration::from_millis(DEFAULT_BURST_INTERVAL_MIN_MS),
            burst_interval_max: Duration::from_millis(DEFAULT_BURST_INTERVAL_MAX_MS),
            burst_size_min: DEFAULT_BURST_SIZE_MIN,
            burst_size_max: DEFAULT_BURST_SIZE_MAX,
            burst_stagger: Duration::from_millis(DEFAULT_BURST_STAGGER_MS),
            fetch_delay: Duration::from_millis(DEFAULT_FETCH_DELAY_MS),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreOptions {
    pub recompute_mode: RecomputeMode,
    pub timestamp_policy: TimestampPolicy,
    pub unmatched_update_policy: UnmatchedUpdatePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedSource {
    Simulated,
    Remote {
        feed_url: String,
        snapshot_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub session: SessionConfig,
    pub simulator: SimulatorConfig,
    pub store: StoreOptions,
    pub source: FeedSource,
    /// `None` disables the periodic randomizer.
    pub randomize_interval: Option<Duration>,
    pub recompute_interval: Duration,
    pub perf_telemetry: bool,
}

impl StartFeedArgs {
    /// Reads the optional JSON config file, then applies environment overrides.
    pub fn load() -> Result<Self, AppError> {
        let mut args = match resolve_env(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(feed_url) = resolve_env(FEED_URL_ENV) {
            args.feed_url = Some(feed_url);
        }
        if let Some(snapshot_url) = resolve_env(SNAPSHOT_URL_ENV) {
            args.snapshot_url = Some(snapshot_url);
        }
        if let Some(seed) = resolve_env(SEED_ENV) {
            let parsed = seed.parse::<u64>().map_err(|_| {
                AppError::InvalidArgument(format!("{SEED_ENV} must be an unsigned integer"))
            })?;
            args.seed = Some(parsed);
        }

        Ok(args)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let mut bytes = std::fs::read(path)?;
        Self::from_json_bytes(&mut bytes)
    }

    pub fn from_json_bytes(bytes: &mut [u8]) -> Result<Self, AppError> {
        Ok(simd_json::serde::from_slice(bytes)?)
    }

    pub fn normalize(self) -> Result<FeedConfig, AppError> {
        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_RECONNECT_ATTEMPTS..=MAX_RECONNECT_ATTEMPTS).contains(&max_reconnect_attempts) {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_RECONNECT_ATTEMPTS} and {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let reconnect_base_delay_ms = self
            .reconnect_base_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
        if !(MIN_RECONNECT_BASE_DELAY_MS..=MAX_RECONNECT_BASE_DELAY_MS)
            .contains(&reconnect_base_delay_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "reconnectBaseDelayMs must be between {MIN_RECONNECT_BASE_DELAY_MS} and {MAX_RECONNECT_BASE_DELAY_MS}"
            )));
        }

        let connect_delay_ms = bounded_delay(
            "connectDelayMs",
            self.connect_delay_ms.unwrap_or(DEFAULT_CONNECT_DELAY_MS),
        )?;
        let initial_data_delay_ms = bounded_delay(
            "initialDataDelayMs",
            self.initial_data_delay_ms
                .unwrap_or(DEFAULT_INITIAL_DATA_DELAY_MS),
        )?;
        let burst_stagger_ms = bounded_delay(
            "burstStaggerMs",
            self.burst_stagger_ms.unwrap_or(DEFAULT_BURST_STAGGER_MS),
        )?;
        let fetch_delay_ms = bounded_delay(
            "fetchDelayMs",
            self.fetch_delay_ms.unwrap_or(DEFAULT_FETCH_DELAY_MS),
        )?;

        let initial_token_count = self
            .initial_token_count
            .unwrap_or(DEFAULT_INITIAL_TOKEN_COUNT);
        if !(MIN_INITIAL_TOKEN_COUNT..=MAX_INITIAL_TOKEN_COUNT).contains(&initial_token_count) {
            return Err(AppError::InvalidArgument(format!(
                "initialTokenCount must be between {MIN_INITIAL_TOKEN_COUNT} and {MAX_INITIAL_TOKEN_COUNT}"
            )));
        }

        let burst_interval_min_ms = self
            .burst_interval_min_ms
            .unwrap_or(DEFAULT_BURST_INTERVAL_MIN_MS);
        let burst_interval_max_ms = self
            .burst_interval_max_ms
            .unwrap_or(DEFAULT_BURST_INTERVAL_MAX_MS);
        if !(MIN_BURST_INTERVAL_MS..=MAX_BURST_INTERVAL_MS).contains(&burst_interval_min_ms)
            || !(MIN_BURST_INTERVAL_MS..=MAX_BURST_INTERVAL_MS).contains(&burst_interval_max_ms)
            || burst_interval_min_ms > burst_interval_max_ms
        {
            return Err(AppError::InvalidArgument(format!(
                "burstIntervalMinMs/burstIntervalMaxMs must be between {MIN_BURST_INTERVAL_MS} and {MAX_BURST_INTERVAL_MS} with min <= max"
            )));
        }

        let burst_size_min = self.burst_size_min.unwrap_or(DEFAULT_BURST_SIZE_MIN);
        let burst_size_max = self.burst_size_max.unwrap_or(DEFAULT_BURST_SIZE_MAX);
        if !(MIN_BURST_SIZE..=MAX_BURST_SIZE).contains(&burst_size_min)
            || !(MIN_BURST_SIZE..=MAX_BURST_SIZE).contains(&burst_size_max)
            || burst_size_min > burst_size_max
        {
            return Err(AppError::InvalidArgument(format!(
                "burstSizeMin/burstSizeMax must be between {MIN_BURST_SIZE} and {MAX_BURST_SIZE} with min <= max"
            )));
        }

        let randomize_interval_ms = self
            .randomize_interval_ms
            .unwrap_or(DEFAULT_RANDOMIZE_INTERVAL_MS);
        let randomize_interval = match randomize_interval_ms {
            0 => None,
            value if (MIN_RANDOMIZE_INTERVAL_MS..=MAX_RANDOMIZE_INTERVAL_MS).contains(&value) => {
                Some(Duration::from_millis(value))
            }
            _ => {
                return Err(AppError::InvalidArgument(format!(
                    "randomizeIntervalMs must be 0 or between {MIN_RANDOMIZE_INTERVAL_MS} and {MAX_RANDOMIZE_INTERVAL_MS}"
                )))
            }
        };

        let recompute_interval_ms = self
            .recompute_interval_ms
            .unwrap_or(DEFAULT_RECOMPUTE_INTERVAL_MS);
        if !(MIN_RECOMPUTE_INTERVAL_MS..=MAX_RECOMPUTE_INTERVAL_MS).contains(&recompute_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "recomputeIntervalMs must be between {MIN_RECOMPUTE_INTERVAL_MS} and {MAX_RECOMPUTE_INTERVAL_MS}"
            )));
        }

        let source = match normalize_url(self.feed_url, &["ws://", "wss://"], "feedUrl")? {
            Some(feed_url) => FeedSource::Remote {
                feed_url,
                snapshot_url: normalize_url(
                    self.snapshot_url,
                    &["http://", "https://"],
                    "snapshotUrl",
                )?,
            },
            None => FeedSource::Simulated,
        };

        Ok(FeedConfig {
            session: SessionConfig {
                max_reconnect_attempts,
                reconnect_base_delay: Duration::from_millis(reconnect_base_delay_ms),
            },
            simulator: SimulatorConfig {
                connect_delay: Duration::from_millis(connect_delay_ms),
                initial_data_delay: Duration::from_millis(initial_data_delay_ms),
                initial_token_count,
                burst_interval_min: Duration::from_millis(burst_interval_min_ms),
                burst_interval_max: Duration::from_millis(burst_interval_max_ms),
                burst_size_min,
                burst_size_max,
                burst_stagger: Duration::from_millis(burst_stagger_ms),
                fetch_delay: Duration::from_millis(fetch_delay_ms),
                seed: self.seed,
            },
            store: StoreOptions {
                recompute_mode: self.recompute_mode.unwrap_or_default(),
                timestamp_policy: self.timestamp_policy.unwrap_or_default(),
                unmatched_update_policy: self.unmatched_update_policy.unwrap_or_default(),
            },
            source,
            randomize_interval,
            recompute_interval: Duration::from_millis(recompute_interval_ms),
            perf_telemetry: self.perf_telemetry.unwrap_or(DEFAULT_PERF_TELEMETRY),
        })
    }
}

fn bounded_delay(field: &str, value_ms: u64) -> Result<u64, AppError> {
    if value_ms > MAX_STARTUP_DELAY_MS {
        return Err(AppError::InvalidArgument(format!(
            "{field} must be at most {MAX_STARTUP_DELAY_MS}"
        )));
    }
    Ok(value_ms)
}

fn normalize_url(
    value: Option<String>,
    schemes: &[&str],
    field: &str,
) -> Result<Option<String>, AppError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let lowered = trimmed.to_ascii_lowercase();
    if !schemes.iter().any(|scheme| lowered.starts_with(scheme)) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must start with one of {}",
            schemes.join(", ")
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn resolve_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = StartFeedArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.simulator, SimulatorConfig::default());
        assert_eq!(config.store, StoreOptions::default());
        assert_eq!(config.source, FeedSource::Simulated);
        assert_eq!(
            config.randomize_interval,
            Some(Duration::from_millis(DEFAULT_RANDOMIZE_INTERVAL_MS))
        );
        assert_eq!(config.perf_telemetry, DEFAULT_PERF_TELEMETRY);
    }

    #[test]
    fn zero_randomize_interval_disables_driver() {
        let config = StartFeedArgs {
            randomize_interval_ms: Some(0),
            ..StartFeedArgs::default()
        }
        .normalize()
        .expect("zero interval is allowed");

        assert_eq!(config.randomize_interval, None);
    }

    #[test]
    fn validates_reconnect_attempt_range() {
        let result = StartFeedArgs {
            max_reconnect_attempts: Some(0),
            ..StartFeedArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_burst_bounds_ordering() {
        let result = StartFeedArgs {
            burst_size_min: Some(5),
            burst_size_max: Some(2),
            ..StartFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());

        let result = StartFeedArgs {
            burst_interval_min_ms: Some(2_000),
            burst_interval_max_ms: Some(1_000),
            ..StartFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn remote_source_requires_websocket_scheme() {
        let result = StartFeedArgs {
            feed_url: Some("https://feed.example".to_string()),
            ..StartFeedArgs::default()
        }
        .normalize();
        assert!(result.is_err());

        let config = StartFeedArgs {
            feed_url: Some(" wss://feed.example/ws ".to_string()),
            snapshot_url: Some("https://feed.example/tokens".to_string()),
            ..StartFeedArgs::default()
        }
        .normalize()
        .expect("remote source should normalize");
        assert_eq!(
            config.source,
            FeedSource::Remote {
                feed_url: "wss://feed.example/ws".to_string(),
                snapshot_url: Some("https://feed.example/tokens".to_string()),
            }
        );
    }

    #[test]
    fn parses_json_config_bytes() {
        let mut payload = br#"{"maxReconnectAttempts":3,"recomputeMode":"deferred","timestampPolicy":"clamp","seed":7}"#
            .to_vec();
        let config = StartFeedArgs::from_json_bytes(&mut payload)
            .expect("json config should parse")
            .normalize()
            .expect("parsed config should be valid");

        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.store.recompute_mode, RecomputeMode::Deferred);
        assert_eq!(config.store.timestamp_policy, TimestampPolicy::Clamp);
        assert_eq!(config.simulator.seed, Some(7));
    }
}
