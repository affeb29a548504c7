use crate::error::AppError;
use crate::pulse::config::SimulatorConfig;
use crate::pulse::session::{FeedConnector, FeedLink};
use crate::pulse::types::{
    FeedEvent, PercentageChange, PriceUpdate, Token, TokenColor, TokenPayload, Trend,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

const SYMBOLS: [&str; 24] = [
    "BTC", "ETH", "SOL", "DOGE", "SHIB", "ADA", "DOT", "AVAX", "MATIC", "UNI", "pissmas", "TikTok",
    "BRENDEN", "BOBE", "sol", "NVIDIAAI", "ASCEND", "BlackWhale", "LAUNCHR", "DUVEMAS", "fly",
    "Amazon", "BOGE", "WHALON",
];
const NAMES: [&str; 24] = [
    "Bitcoin",
    "Ethereum",
    "Solana",
    "Dogecoin",
    "Shiba Inu",
    "Cardano",
    "Polkadot",
    "Avalanche",
    "Polygon",
    "Uniswap",
    "pissmas",
    "TikTok",
    "THE WATER GUY",
    "BOBE",
    "猪",
    "NVIDIAAIDev",
    "ASCEND",
    "The Black Whale",
    "LAUNCHR",
    "DUVEMAS",
    "flying squirrel",
    "Amazon AI Coin",
    "BOGE",
    "Whale alon",
];
const COLORS: [TokenColor; 5] = [
    TokenColor::Green,
    TokenColor::Red,
    TokenColor::Yellow,
    TokenColor::Blue,
    TokenColor::Purple,
];
const CONTRACT_SUFFIXES: [&str; 8] = ["pump", "XTt1", "xLRa", "EaRj", "Wasg", "j3qG", "P6NF", "hZcE"];
const AGE_LABELS: [&str; 11] = [
    "3mo", "1h", "1mo", "6d", "2d", "4h", "2m", "19d", "1h", "24m", "57m",
];
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_LENGTH: usize = 9;
const MAX_TOKEN_AGE_MS: f64 = 3_600_000.0;
const PRICE_UPDATE_SHARE: f64 = 0.6;
const NEW_TOKEN_SHARE: f64 = 0.8;
const KNOWN_TARGET_PROBABILITY: f64 = 0.9;
const OVERLAP_PROBABILITY: f64 = 0.1;
const MIN_PRICE: f64 = 0.001;

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn random_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

fn pick<'a, T, R: Rng + ?Sized>(rng: &mut R, values: &'a [T]) -> &'a T {
    &values[rng.gen_range(0..values.len())]
}

/// Roughly 35% new pairs, 35% final stretch, 30% migrated, with a 10% chance
/// of a second overlapping flag.
fn lifecycle_flags<R: Rng + ?Sized>(rng: &mut R) -> (bool, bool, bool) {
    let column = rng.gen::<f64>();
    let (mut is_new, mut is_final_stretch, mut is_migrated) = if column < 0.35 {
        (true, false, false)
    } else if column < 0.70 {
        (false, true, false)
    } else {
        (false, false, true)
    };

    if rng.gen_bool(OVERLAP_PROBABILITY) {
        let overlap = rng.gen::<f64>();
        if overlap < 0.33 {
            is_new = true;
            is_final_stretch = true;
        } else if overlap < 0.66 {
            is_final_stretch = true;
            is_migrated = true;
        } else {
            is_new = true;
            is_migrated = true;
        }
    }

    (is_new, is_final_stretch, is_migrated)
}

pub fn random_token<R: Rng + ?Sized>(rng: &mut R, now_ms: i64) -> Token {
    let change = (rng.gen::<f64>() - 0.5) * 100.0;
    let (is_new, is_final_stretch, is_migrated) = lifecycle_flags(rng);
    let contract_prefix = random_id(rng)[..4].to_ascii_uppercase();
    let second_change = if rng.gen_bool(0.5) {
        0.0
    } else {
        (rng.gen::<f64>() - 0.5) * 20.0
    };

    Token {
        id: random_id(rng),
        symbol: pick(rng, &SYMBOLS).to_string(),
        name: pick(rng, &NAMES).to_string(),
        price: rng.gen::<f64>() * 1_000.0 + MIN_PRICE,
        price_change_24h: change,
        volume_24h: rng.gen::<f64>() * 1e9,
        market_cap: rng.gen::<f64>() * 1e10,
        liquidity: rng.gen::<f64>() * 1e8,
        holder_count: rng.gen_range(0..1_000_000),
        is_new,
        is_final_stretch,
        is_migrated,
        timestamp: now_ms - (rng.gen::<f64>() * MAX_TOKEN_AGE_MS) as i64,
        trend: Trend::from_change(change),
        color: Some(*pick(rng, &COLORS)),
        contract_address: Some(format!(
            "{contract_prefix}...{}",
            pick(rng, &CONTRACT_SUFFIXES)
        )),
        transaction_count: Some(rng.gen_range(0..3_000)),
        fee: Some(rng.gen::<f64>() * 0.1),
        percentage_changes: Some(vec![
            PercentageChange {
                value: change,
                label: None,
            },
            PercentageChange {
                value: second_change,
                label: None,
            },
            PercentageChange {
                value: 0.0,
                label: Some(pick(rng, &AGE_LABELS).to_string()),
            },
            PercentageChange {
                value: change,
                label: None,
            },
        ]),
        icon_count: Some(rng.gen_range(1..=5)),
        badge_count: Some(rng.gen_range(1..=5)),
        holder_ratio: Some(format!(
            "{}/{}",
            rng.gen_range(0_u32..10),
            rng.gen_range(0_u32..1_000)
        )),
    }
}

/// Small drift used by the periodic randomizer: ±5% price, a fresh 24h
/// change, and a current timestamp.
pub fn jitter_payload<R: Rng + ?Sized>(rng: &mut R, token: &Token, now_ms: i64) -> TokenPayload {
    TokenPayload {
        id: Some(token.id.clone()),
        price: Some((token.price * (0.95 + rng.gen::<f64>() * 0.1)).max(MIN_PRICE)),
        price_change_24h: Some((rng.gen::<f64>() - 0.5) * 50.0),
        timestamp: Some(now_ms),
        ..TokenPayload::default()
    }
}

/// Handle for forcing transport faults on a simulated connector.
#[derive(Debug, Clone, Default)]
pub struct FaultHandle {
    drop_link: Arc<Notify>,
    refuse_connects: Arc<AtomicU32>,
}

impl FaultHandle {
    /// Ends the current link with a transport error, or the next one if none is open.
    pub fn drop_link(&self) {
        info!("injecting simulated connection error");
        self.drop_link.notify_one();
    }

    pub fn refuse_next_connects(&self, count: u32) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    fn take_refusal(&self) -> bool {
        self.refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[derive(Debug, Clone)]
struct KnownToken {
    id: String,
    price: f64,
}

/// Ids the simulator has published on the current link, so updates and
/// removals mostly target tokens that exist.
#[derive(Debug, Default)]
struct FeedBook {
    known: Vec<KnownToken>,
}

impl FeedBook {
    fn reset(&mut self, tokens: &[Token]) {
        self.known = tokens
            .iter()
            .map(|token| KnownToken {
                id: token.id.clone(),
                price: token.price,
            })
            .collect();
    }

    fn next_event<R: Rng + ?Sized>(&mut self, rng: &mut R, now_ms: i64) -> FeedEvent {
        let roll = rng.gen::<f64>();
        if roll < PRICE_UPDATE_SHARE {
            let change = (rng.gen::<f64>() - 0.5) * 30.0;
            let update = if !self.known.is_empty() && rng.gen_bool(KNOWN_TARGET_PROBABILITY) {
                let index = rng.gen_range(0..self.known.len());
                let entry = &mut self.known[index];
                entry.price = (entry.price * (1.0 + change / 100.0)).max(MIN_PRICE);
                PriceUpdate {
                    token_id: entry.id.clone(),
                    new_price: entry.price,
                    change,
                    timestamp: now_ms,
                }
            } else {
                PriceUpdate {
                    token_id: random_id(rng),
                    new_price: (100.0 + change).max(MIN_PRICE),
                    change,
                    timestamp: now_ms,
                }
            };
            FeedEvent::PriceUpdate(update)
        } else if roll < NEW_TOKEN_SHARE {
            let mut token = random_token(rng, now_ms);
            token.timestamp = now_ms;
            self.known.push(KnownToken {
                id: token.id.clone(),
                price: token.price,
            });
            FeedEvent::NewToken(token.into())
        } else if !self.known.is_empty() && rng.gen_bool(KNOWN_TARGET_PROBABILITY) {
            let index = rng.gen_range(0..self.known.len());
            FeedEvent::TokenRemoved(self.known.swap_remove(index).id)
        } else {
            FeedEvent::TokenRemoved(random_id(rng))
        }
    }
}

enum LinkPhase {
    AwaitInitial,
    Idle { next_burst_at: Instant },
    Burst {
        remaining: usize,
        next_at: Instant,
        burst_started_at: Instant,
        interval: Duration,
    },
    Closed,
}

struct LinkState {
    phase: LinkPhase,
    config: SimulatorConfig,
    rng: Arc<Mutex<StdRng>>,
    book: FeedBook,
    faults: FaultHandle,
}

impl LinkState {
    fn burst_interval(&self) -> Duration {
        let min = self.config.burst_interval_min;
        let max = self.config.burst_interval_max;
        if min >= max {
            return min;
        }
        self.rng.lock().gen_range(min..=max)
    }

    fn burst_size(&self) -> usize {
        self.rng
            .lock()
            .gen_range(self.config.burst_size_min..=self.config.burst_size_max)
    }
}

/// Sleeps until `deadline` unless a fault fires first.
async fn wait_or_fault(faults: &FaultHandle, deadline: Instant) -> bool {
    tokio::select! {
        _ = faults.drop_link.notified() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

async fn next_link_item(mut state: LinkState) -> Option<(Result<FeedEvent, AppError>, LinkState)> {
    loop {
        match state.phase {
            LinkPhase::Closed => return None,
            LinkPhase::AwaitInitial => {
                let deadline = Instant::now() + state.config.initial_data_delay;
                if !wait_or_fault(&state.faults, deadline).await {
                    state.phase = LinkPhase::Closed;
                    return Some((Err(simulated_fault()), state));
                }
                let now_ms = now_unix_ms();
                let tokens: Vec<Token> = {
                    let mut rng = state.rng.lock();
                    (0..state.config.initial_token_count)
                        .map(|_| random_token(&mut *rng, now_ms))
                        .collect()
                };
                state.book.reset(&tokens);
                let interval = state.burst_interval();
                state.phase = LinkPhase::Idle {
                    next_burst_at: Instant::now() + interval,
                };
                debug!(count = tokens.len(), "simulated initial_data");
                let payloads = tokens.into_iter().map(TokenPayload::from).collect();
                return Some((Ok(FeedEvent::InitialData(payloads)), state));
            }
            LinkPhase::Idle { next_burst_at } => {
                if !wait_or_fault(&state.faults, next_burst_at).await {
                    state.phase = LinkPhase::Closed;
                    return Some((Err(simulated_fault()), state));
                }
                let remaining = state.burst_size();
                let interval = state.burst_interval();
                state.phase = LinkPhase::Burst {
                    remaining,
                    next_at: next_burst_at,
                    burst_started_at: next_burst_at,
                    interval,
                };
            }
            LinkPhase::Burst {
                remaining,
                next_at,
                burst_started_at,
                interval,
            } => {
                if !wait_or_fault(&state.faults, next_at).await {
                    state.phase = LinkPhase::Closed;
                    return Some((Err(simulated_fault()), state));
                }
                let event = {
                    let mut rng = state.rng.lock();
                    state.book.next_event(&mut *rng, now_unix_ms())
                };
                state.phase = if remaining > 1 {
                    LinkPhase::Burst {
                        remaining: remaining - 1,
                        next_at: next_at + state.config.burst_stagger,
                        burst_started_at,
                        interval,
                    }
                } else {
                    LinkPhase::Idle {
                        next_burst_at: (burst_started_at + interval).max(next_at),
                    }
                };
                return Some((Ok(event), state));
            }
        }
    }
}

fn simulated_fault() -> AppError {
    AppError::Transport("simulated connection error".to_string())
}

/// In-process feed: emits `initial_data` shortly after each connect, then
/// bursts of mixed events at randomized intervals.
pub struct SimulatedConnector {
    config: SimulatorConfig,
    rng: Arc<Mutex<StdRng>>,
    faults: FaultHandle,
}

impl SimulatedConnector {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: Arc::new(Mutex::new(seeded_rng(config.seed))),
            config,
            faults: FaultHandle::default(),
        }
    }

    pub fn fault_handle(&self) -> FaultHandle {
        self.faults.clone()
    }
}

#[async_trait]
impl FeedConnector for SimulatedConnector {
    async fn connect(&self) -> Result<FeedLink, AppError> {
        tokio::time::sleep(self.config.connect_delay).await;
        if self.faults.take_refusal() {
            return Err(AppError::Transport(
                "simulated connection refused".to_string(),
            ));
        }

        let state = LinkState {
            phase: LinkPhase::AwaitInitial,
            config: self.config,
            rng: Arc::clone(&self.rng),
            book: FeedBook::default(),
            faults: self.faults.clone(),
        };
        let link: FeedLink = stream::unfold(state, next_link_item).boxed();
        Ok(link)
    }
}

/// Supplies a full token set for the loading lifecycle.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn fetch_tokens(&self) -> Result<Vec<TokenPayload>, AppError>;
}

pub struct SimulatedTokenSource {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
}

impl SimulatedTokenSource {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: Mutex::new(seeded_rng(config.seed.map(|seed| seed.wrapping_add(1)))),
            config,
        }
    }
}

#[async_trait]
impl TokenSource for SimulatedTokenSource {
    async fn fetch_tokens(&self) -> Result<Vec<TokenPayload>, AppError> {
        tokio::time::sleep(self.config.fetch_delay).await;
        let now_ms = now_unix_ms();
        let mut rng = self.rng.lock();
        Ok((0..self.config.initial_token_count)
            .map(|_| random_token(&mut *rng, now_ms).into())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::types::ColumnKind;

    fn quick_config(seed: u64) -> SimulatorConfig {
        SimulatorConfig {
            connect_delay: Duration::from_millis(100),
            initial_data_delay: Duration::from_millis(200),
            initial_token_count: 20,
            seed: Some(seed),
            ..SimulatorConfig::default()
        }
    }

    #[test]
    fn random_tokens_are_complete_and_in_a_column() {
        let mut rng = seeded_rng(Some(42));
        for _ in 0..200 {
            let token = random_token(&mut rng, 10_000_000);
            assert_eq!(token.id.len(), ID_LENGTH);
            assert!(token.price >= MIN_PRICE && token.price <= 1_000.0 + MIN_PRICE);
            assert!(token.has_any_column(&ColumnKind::ALL));
            assert_eq!(token.trend, Trend::from_change(token.price_change_24h));
            assert!(token.timestamp <= 10_000_000);
            assert!(Token::try_from(TokenPayload::from(token)).is_ok());
        }
    }

    #[test]
    fn same_seed_generates_same_tokens() {
        let mut first = seeded_rng(Some(7));
        let mut second = seeded_rng(Some(7));
        assert_eq!(random_token(&mut first, 1), random_token(&mut second, 1));
    }

    #[test]
    fn jitter_stays_within_five_percent() {
        let mut rng = seeded_rng(Some(3));
        let mut token = random_token(&mut rng, 0);
        token.price = 100.0;
        for _ in 0..100 {
            let payload = jitter_payload(&mut rng, &token, 55);
            let price = payload.price.expect("jitter always sets a price");
            assert!((95.0..=105.0).contains(&price));
            let change = payload.price_change_24h.expect("jitter always sets a change");
            assert!((-25.0..=25.0).contains(&change));
            assert_eq!(payload.timestamp, Some(55));
        }
    }

    #[test]
    fn book_targets_known_ids_and_forgets_removed_ones() {
        let mut rng = seeded_rng(Some(11));
        let seed_tokens: Vec<Token> = (0..10).map(|_| random_token(&mut rng, 0)).collect();
        let mut book = FeedBook::default();
        book.reset(&seed_tokens);

        let mut removed = Vec::new();
        let mut known_updates = 0;
        for _ in 0..300 {
            match book.next_event(&mut rng, 1) {
                FeedEvent::TokenRemoved(id) => removed.push(id),
                FeedEvent::PriceUpdate(update) => {
                    if seed_tokens.iter().any(|token| token.id == update.token_id) {
                        known_updates += 1;
                    }
                }
                _ => {}
            }
        }

        assert!(known_updates > 0);
        for id in removed {
            assert!(book.known.iter().all(|entry| entry.id != id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn link_emits_initial_data_then_bursts() {
        let connector = SimulatedConnector::new(quick_config(5));
        let mut link = connector.connect().await.expect("simulated connect succeeds");

        let first = link.next().await.expect("link yields initial data");
        let Ok(FeedEvent::InitialData(tokens)) = first else {
            panic!("first event must be initial_data");
        };
        assert_eq!(tokens.len(), 20);

        for _ in 0..10 {
            let event = link.next().await.expect("link stays open");
            assert!(!matches!(event, Ok(FeedEvent::InitialData(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_are_sized_staggered_and_spaced_by_interval() {
        let connector = SimulatedConnector::new(SimulatorConfig {
            burst_interval_min: Duration::from_millis(1_000),
            burst_interval_max: Duration::from_millis(1_000),
            burst_size_min: 2,
            burst_size_max: 4,
            burst_stagger: Duration::from_millis(200),
            ..quick_config(13)
        });
        let mut link = connector.connect().await.expect("simulated connect succeeds");
        assert!(matches!(link.next().await, Some(Ok(FeedEvent::InitialData(_)))));
        let initial_at = Instant::now();

        let mut offsets_ms = Vec::new();
        for _ in 0..40 {
            let event = link.next().await.expect("link stays open");
            assert!(event.is_ok());
            offsets_ms.push((Instant::now() - initial_at).as_millis() as u64);
        }

        let mut bursts: Vec<Vec<u64>> = Vec::new();
        for offset in offsets_ms {
            let burst = (offset / 1_000) as usize;
            assert!(burst >= 1, "first burst waits one interval");
            while bursts.len() < burst {
                bursts.push(Vec::new());
            }
            bursts[burst - 1].push(offset % 1_000);
        }
        // The last burst may be cut off by the sample size.
        bursts.pop();

        assert!(!bursts.is_empty());
        for within in &bursts {
            assert!((2..=4).contains(&within.len()), "burst of {}", within.len());
            let expected: Vec<u64> = (0..within.len() as u64).map(|step| step * 200).collect();
            assert_eq!(within, &expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fault_handle_ends_link_with_transport_error() {
        let connector = SimulatedConnector::new(quick_config(9));
        let faults = connector.fault_handle();
        let mut link = connector.connect().await.expect("simulated connect succeeds");
        assert!(matches!(link.next().await, Some(Ok(FeedEvent::InitialData(_)))));

        faults.drop_link();
        let dropped = link.next().await.expect("fault surfaces as an item");
        assert!(matches!(dropped, Err(AppError::Transport(_))));
        assert!(link.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_are_consumed_in_order() {
        let connector = SimulatedConnector::new(quick_config(1));
        connector.fault_handle().refuse_next_connects(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_source_waits_then_returns_tokens() {
        let source = SimulatedTokenSource::new(quick_config(2));
        let started = Instant::now();
        let tokens = source.fetch_tokens().await.expect("simulated fetch succeeds");

        assert_eq!(tokens.len(), 20);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
