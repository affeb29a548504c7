use crate::pulse::config::{RecomputeMode, StoreOptions, TimestampPolicy, UnmatchedUpdatePolicy};
use crate::pulse::query::project;
use crate::pulse::types::{
    ColumnKind, FilterPatch, FilterState, LoadingState, NumericRange, PriceUpdate, SortDirection,
    SortField, StorePerfSnapshot, StoreSnapshot, StoreStats, Token, TokenPayload,
};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

const PERF_WINDOW_CAPACITY: usize = 2_048;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Replaced { count: usize, rejected: usize },
    Inserted,
    Merged,
    Removed,
    Ignored { reason: &'static str },
    Stale { incoming: i64, current: i64 },
    Rejected { reason: String },
}

impl ApplyOutcome {
    pub fn changed_entities(&self) -> bool {
        matches!(
            self,
            Self::Replaced { .. } | Self::Inserted | Self::Merged | Self::Removed
        )
    }
}

/// Authoritative token set plus its derived projection.
///
/// Entities are kept newest-first: fresh inserts go to the front, merges keep
/// their slot. That order is the input order the stable sort preserves on ties.
#[derive(Debug)]
pub struct TokenStore {
    entities: Vec<Token>,
    positions: HashMap<String, usize>,
    projection: Vec<Token>,
    filters: FilterState,
    loading_state: LoadingState,
    load_error: Option<String>,
    transport_error: Option<String>,
    options: StoreOptions,
    dirty: bool,
    stats: StoreStats,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl TokenStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            entities: Vec::new(),
            positions: HashMap::new(),
            projection: Vec::new(),
            filters: FilterState::default(),
            loading_state: LoadingState::Idle,
            load_error: None,
            transport_error: None,
            options,
            dirty: false,
            stats: StoreStats::default(),
        }
    }

    pub fn entities(&self) -> &[Token] {
        &self.entities
    }

    pub fn projection(&self) -> &[Token] {
        &self.projection
    }

    pub fn filters(&self) -> &FilterState {
        &self.filters
    }

    pub fn loading_state(&self) -> LoadingState {
        self.loading_state
    }

    /// The latest transport error, else the last failed load.
    pub fn error(&self) -> Option<&str> {
        self.transport_error
            .as_deref()
            .or(self.load_error.as_deref())
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Switching to eager mode settles any pending deferred work immediately.
    pub fn set_options(&mut self, options: StoreOptions) {
        self.options = options;
        if options.recompute_mode == RecomputeMode::Eager {
            self.flush();
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Token> {
        self.positions.get(id).map(|&index| &self.entities[index])
    }

    pub fn entity_at(&self, index: usize) -> Option<&Token> {
        self.entities.get(index)
    }

    /// Replaces the authoritative set wholesale. Malformed entries are skipped;
    /// a repeated id overwrites the earlier entry in place.
    pub fn apply_initial(&mut self, payloads: Vec<TokenPayload>) -> ApplyOutcome {
        let mut entities: Vec<Token> = Vec::with_capacity(payloads.len());
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(payloads.len());
        let mut rejected = 0_usize;

        for payload in payloads {
            match Token::try_from(payload) {
                Ok(token) => match positions.get(&token.id) {
                    Some(&index) => entities[index] = token,
                    None => {
                        positions.insert(token.id.clone(), entities.len());
                        entities.push(token);
                    }
                },
                Err(error) => {
                    rejected += 1;
                    warn!("skipping malformed token in initial data: {error}");
                }
            }
        }

        let count = entities.len();
        self.entities = entities;
        self.positions = positions;
        self.loading_state = LoadingState::Success;
        self.load_error = None;
        self.transport_error = None;
        self.stats.rejected = self.stats.rejected.saturating_add(rejected as u64);
        self.after_mutation();
        debug!(count, rejected, "applied initial token set");

        ApplyOutcome::Replaced { count, rejected }
    }

    /// Inserts an unknown id (every required field must be present) or merges
    /// the present fields into the existing entity.
    pub fn apply_upsert(&mut self, payload: TokenPayload) -> ApplyOutcome {
        if let Err(error) = payload.validate() {
            return self.reject(error.to_string());
        }
        let id = match payload.identifier() {
            Ok(id) => id.to_string(),
            Err(error) => return self.reject(error.to_string()),
        };

        let Some(index) = self.positions.get(&id).copied() else {
            return match Token::try_from(payload) {
                Ok(token) => {
                    self.entities.insert(0, token);
                    self.rebuild_positions();
                    self.stats.inserted = self.stats.inserted.saturating_add(1);
                    self.after_mutation();
                    ApplyOutcome::Inserted
                }
                Err(error) => self.reject(error.to_string()),
            };
        };

        let current = self.entities[index].timestamp;
        let timestamp = match self.resolve_timestamp(&id, current, payload.timestamp) {
            Ok(timestamp) => timestamp,
            Err(outcome) => return outcome,
        };

        let token = &mut self.entities[index];
        payload.merge_into(token);
        token.timestamp = timestamp;
        self.stats.merged = self.stats.merged.saturating_add(1);
        self.after_mutation();
        ApplyOutcome::Merged
    }

    pub fn apply_remove(&mut self, id: &str) -> ApplyOutcome {
        let Some(index) = self.positions.get(id).copied() else {
            self.stats.ignored = self.stats.ignored.saturating_add(1);
            debug!(id, "token_removed for unknown id ignored");
            return ApplyOutcome::Ignored {
                reason: "unknown token id",
            };
        };

        self.entities.remove(index);
        self.rebuild_positions();
        // Purged eagerly so a deferred projection never references a removed id.
        self.projection.retain(|token| token.id != id);
        self.stats.removed = self.stats.removed.saturating_add(1);
        self.after_mutation();
        ApplyOutcome::Removed
    }

    pub fn apply_price_update(&mut self, update: PriceUpdate) -> ApplyOutcome {
        if let Err(error) = update.validate() {
            return self.reject(error.to_string());
        }

        let target_id = if self.positions.contains_key(&update.token_id) {
            update.token_id
        } else {
            match self.options.unmatched_update_policy {
                UnmatchedUpdatePolicy::Drop => {
                    self.stats.ignored = self.stats.ignored.saturating_add(1);
                    debug!(token_id = %update.token_id, "price_update for unknown id dropped");
                    return ApplyOutcome::Ignored {
                        reason: "unknown token id",
                    };
                }
                UnmatchedUpdatePolicy::Retarget => match self.retarget(&update.token_id) {
                    Some(id) => id,
                    None => {
                        self.stats.ignored = self.stats.ignored.saturating_add(1);
                        return ApplyOutcome::Ignored {
                            reason: "no entity to retarget",
                        };
                    }
                },
            }
        };

        self.apply_upsert(TokenPayload {
            id: Some(target_id),
            price: Some(update.new_price),
            price_change_24h: Some(update.change),
            timestamp: Some(update.timestamp),
            ..TokenPayload::default()
        })
    }

    /// Merges into the current filters without recomputing. Invalid ranges
    /// are ignored and the previous range kept.
    pub fn set_filters(&mut self, patch: FilterPatch) {
        if let Some(search) = patch.search {
            self.filters.search = search;
        }
        if let Some(range) = patch.price_range {
            self.filters.price_range = checked_range("priceRange", range, self.filters.price_range);
        }
        if let Some(range) = patch.volume_range {
            self.filters.volume_range =
                checked_range("volumeRange", range, self.filters.volume_range);
        }
        if let Some(columns) = patch.columns {
            let mut unique: Vec<ColumnKind> = Vec::with_capacity(columns.len());
            for column in columns {
                if !unique.contains(&column) {
                    unique.push(column);
                }
            }
            self.filters.columns = unique;
        }
        if let Some(sort_by) = patch.sort_by {
            if sort_by == SortField::Unsupported {
                warn!("unsupported sort field requested; rows keep their current order");
            }
            self.filters.sort_by = sort_by;
        }
        if let Some(sort_direction) = patch.sort_direction {
            self.filters.sort_direction = sort_direction;
        }
        self.dirty = true;
    }

    pub fn recompute_projection(&mut self) {
        self.projection = project(&self.entities, &self.filters);
        self.dirty = false;
        self.stats.recomputes = self.stats.recomputes.saturating_add(1);
    }

    /// Recomputes only when something changed since the last recompute.
    pub fn flush(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.recompute_projection();
        true
    }

    pub fn begin_loading(&mut self) {
        self.loading_state = LoadingState::Loading;
    }

    /// Fetch failure: the error is surfaced, existing data stays.
    pub fn fail_loading(&mut self, message: String) {
        self.loading_state = LoadingState::Error;
        self.load_error = Some(message);
    }

    /// Transport failure: recorded for display without touching data or loading state.
    pub fn record_transport_error(&mut self, message: String) {
        self.transport_error = Some(message);
    }

    /// Clears the transport error only; a failed load stays reported until
    /// the next successful load.
    pub fn clear_error(&mut self) -> bool {
        self.transport_error.take().is_some()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            entities: self.entities.clone(),
            projection: self.projection.clone(),
            loading_state: self.loading_state,
            error: self.error().map(str::to_string),
            filters: self.filters.clone(),
            stats: self.stats,
        }
    }

    fn after_mutation(&mut self) {
        match self.options.recompute_mode {
            RecomputeMode::Eager => self.recompute_projection(),
            RecomputeMode::Deferred => self.dirty = true,
        }
    }

    fn reject(&mut self, reason: String) -> ApplyOutcome {
        self.stats.rejected = self.stats.rejected.saturating_add(1);
        warn!("rejected feed event: {reason}");
        ApplyOutcome::Rejected { reason }
    }

    fn resolve_timestamp(
        &mut self,
        id: &str,
        current: i64,
        incoming: Option<i64>,
    ) -> Result<i64, ApplyOutcome> {
        let Some(incoming) = incoming else {
            return Ok(current);
        };
        if incoming >= current {
            return Ok(incoming);
        }

        match self.options.timestamp_policy {
            TimestampPolicy::Reject => {
                self.stats.stale = self.stats.stale.saturating_add(1);
                warn!(id, incoming, current, "rejected out-of-order update");
                Err(ApplyOutcome::Stale { incoming, current })
            }
            TimestampPolicy::Clamp => {
                debug!(id, incoming, current, "clamped out-of-order timestamp");
                Ok(current)
            }
            TimestampPolicy::Accept => Ok(incoming),
        }
    }

    fn retarget(&self, token_id: &str) -> Option<String> {
        if self.entities.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        token_id.hash(&mut hasher);
        let index = (hasher.finish() % self.entities.len() as u64) as usize;
        Some(self.entities[index].id.clone())
    }

    fn rebuild_positions(&mut self) {
        self.positions.clear();
        for (index, token) in self.entities.iter().enumerate() {
            self.positions.insert(token.id.clone(), index);
        }
    }
}

fn checked_range(field: &str, candidate: NumericRange, current: NumericRange) -> NumericRange {
    if candidate.is_valid() {
        candidate
    } else {
        warn!(
            min = candidate.min,
            max = candidate.max,
            "ignoring invalid {field} filter"
        );
        current
    }
}

#[derive(Debug, Clone)]
struct RollingWindowU32 {
    values: Box<[u32; PERF_WINDOW_CAPACITY]>,
    len: usize,
    cursor: usize,
}

impl Default for RollingWindowU32 {
    fn default() -> Self {
        Self {
            values: Box::new([0; PERF_WINDOW_CAPACITY]),
            len: 0,
            cursor: 0,
        }
    }
}

impl RollingWindowU32 {
    fn push(&mut self, value: u32) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % PERF_WINDOW_CAPACITY;
        if self.len < PERF_WINDOW_CAPACITY {
            self.len += 1;
        }
    }

    fn percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        if self.len == 0 {
            return (None, None, None);
        }

        let mut snapshot = Vec::with_capacity(self.len);
        snapshot.extend_from_slice(&self.values[..self.len]);
        snapshot.sort_unstable();

        (
            percentile_from_sorted(&snapshot, 50),
            percentile_from_sorted(&snapshot, 95),
            percentile_from_sorted(&snapshot, 99),
        )
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len().saturating_sub(1);
    let index = max_index.saturating_mul(percentile).saturating_div(100);
    sorted_values.get(index).copied()
}

#[derive(Debug, Default)]
struct StorePerfTelemetry {
    apply_us: RollingWindowU32,
    recompute_us: RollingWindowU32,
    apply_count: u64,
    recompute_count: u64,
}

impl StorePerfTelemetry {
    fn record_apply(&mut self, elapsed_us: u32) {
        self.apply_us.push(elapsed_us);
        self.apply_count = self.apply_count.saturating_add(1);
    }

    fn record_recompute(&mut self, elapsed_us: u32) {
        self.recompute_us.push(elapsed_us);
        self.recompute_count = self.recompute_count.saturating_add(1);
    }

    fn snapshot(&self, now_ms: i64) -> StorePerfSnapshot {
        let (apply_p50_us, apply_p95_us, apply_p99_us) = self.apply_us.percentiles();
        let (recompute_p50_us, recompute_p95_us, recompute_p99_us) =
            self.recompute_us.percentiles();

        StorePerfSnapshot {
            t: now_ms,
            apply_p50_us,
            apply_p95_us,
            apply_p99_us,
            recompute_p50_us,
            recompute_p95_us,
            recompute_p99_us,
            apply_count: self.apply_count,
            recompute_count: self.recompute_count,
        }
    }
}

fn elapsed_us(started_at: Instant) -> u32 {
    started_at.elapsed().as_micros().min(u32::MAX as u128) as u32
}

/// Cloneable handle that serializes every mutation through one lock and
/// publishes a consistent snapshot whenever the projection is current.
#[derive(Clone)]
pub struct SharedTokenStore {
    inner: Arc<Mutex<TokenStore>>,
    perf: Arc<Mutex<StorePerfTelemetry>>,
    snapshots: Arc<watch::Sender<Arc<StoreSnapshot>>>,
}

impl SharedTokenStore {
    pub fn new(options: StoreOptions) -> Self {
        let (sender, _) = watch::channel(Arc::new(StoreSnapshot::empty()));
        Self {
            inner: Arc::new(Mutex::new(TokenStore::new(options))),
            perf: Arc::new(Mutex::new(StorePerfTelemetry::default())),
            snapshots: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn read<R>(&self, reader: impl FnOnce(&TokenStore) -> R) -> R {
        reader(&self.inner.lock())
    }

    /// Runs one mutation atomically; in eager mode the published snapshot
    /// reflects it before the lock is released.
    pub fn mutate(&self, mutation: impl FnOnce(&mut TokenStore) -> ApplyOutcome) -> ApplyOutcome {
        let started_at = Instant::now();
        let mut store = self.inner.lock();
        let outcome = mutation(&mut store);
        self.perf.lock().record_apply(elapsed_us(started_at));
        if outcome.changed_entities() && !store.is_dirty() {
            self.publish(&store);
        }
        outcome
    }

    pub fn apply_initial(&self, payloads: Vec<TokenPayload>) -> ApplyOutcome {
        self.mutate(|store| store.apply_initial(payloads))
    }

    pub fn apply_upsert(&self, payload: TokenPayload) -> ApplyOutcome {
        self.mutate(|store| store.apply_upsert(payload))
    }

    pub fn apply_remove(&self, id: &str) -> ApplyOutcome {
        self.mutate(|store| store.apply_remove(id))
    }

    pub fn apply_price_update(&self, update: PriceUpdate) -> ApplyOutcome {
        self.mutate(|store| store.apply_price_update(update))
    }

    pub fn set_filters(&self, patch: FilterPatch) {
        self.inner.lock().set_filters(patch);
    }

    pub fn reconfigure(&self, options: StoreOptions) {
        let mut store = self.inner.lock();
        let was_dirty = store.is_dirty();
        store.set_options(options);
        if was_dirty && !store.is_dirty() {
            self.publish(&store);
        }
    }

    pub fn recompute_projection(&self) {
        let started_at = Instant::now();
        let mut store = self.inner.lock();
        store.recompute_projection();
        self.perf.lock().record_recompute(elapsed_us(started_at));
        self.publish(&store);
    }

    /// Deferred-mode tick: recompute and publish only if something changed.
    pub fn flush(&self) -> bool {
        let started_at = Instant::now();
        let mut store = self.inner.lock();
        if !store.flush() {
            return false;
        }
        self.perf.lock().record_recompute(elapsed_us(started_at));
        self.publish(&store);
        true
    }

    pub fn sort(&self, field: SortField, direction: SortDirection) {
        self.set_filters(FilterPatch::sort(field, direction));
        self.recompute_projection();
    }

    pub fn begin_loading(&self) {
        let mut store = self.inner.lock();
        store.begin_loading();
        self.publish(&store);
    }

    pub fn fail_loading(&self, message: String) {
        let mut store = self.inner.lock();
        store.fail_loading(message);
        self.publish(&store);
    }

    pub fn record_transport_error(&self, message: String) {
        let mut store = self.inner.lock();
        store.record_transport_error(message);
        self.publish(&store);
    }

    pub fn clear_error(&self) {
        let mut store = self.inner.lock();
        if store.clear_error() {
            self.publish(&store);
        }
    }

    pub fn perf_snapshot(&self, now_ms: i64) -> StorePerfSnapshot {
        self.perf.lock().snapshot(now_ms)
    }

    fn publish(&self, store: &TokenStore) {
        self.snapshots.send_replace(Arc::new(store.snapshot()));
    }
}
