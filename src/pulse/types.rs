use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRICE_RANGE: NumericRange = NumericRange {
    min: 0.0,
    max: 1_000_000.0,
};
pub const DEFAULT_VOLUME_RANGE: NumericRange = NumericRange {
    min: 0.0,
    max: 1_000_000_000.0,
};
pub const DEFAULT_SORT_FIELD: SortField = SortField::Price;
pub const DEFAULT_SORT_DIRECTION: SortDirection = SortDirection::Desc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Neutral,
}

impl Trend {
    pub fn from_change(change: f64) -> Self {
        if change > 0.0 {
            Self::Up
        } else if change < 0.0 {
            Self::Down
        } else {
            Self::Neutral
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenColor {
    Green,
    Red,
    Yellow,
    Blue,
    Purple,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PercentageChange {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Lifecycle bucket keys. A token may belong to any number of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ColumnKind {
    NewPairs,
    FinalStretch,
    Migrated,
}

impl ColumnKind {
    pub const ALL: [ColumnKind; 3] = [Self::NewPairs, Self::FinalStretch, Self::Migrated];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewPairs => "newPairs",
            Self::FinalStretch => "finalStretch",
            Self::Migrated => "migrated",
        }
    }

    pub fn contains(self, token: &Token) -> bool {
        match self {
            Self::NewPairs => token.is_new,
            Self::FinalStretch => token.is_final_stretch,
            Self::Migrated => token.is_migrated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub price_change_24h: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub liquidity: f64,
    pub holder_count: u64,
    pub is_new: bool,
    pub is_final_stretch: bool,
    pub is_migrated: bool,
    pub timestamp: i64,
    pub trend: Trend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<TokenColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_changes: Option<Vec<PercentageChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_ratio: Option<String>,
}

impl Token {
    pub fn has_any_column(&self, columns: &[ColumnKind]) -> bool {
        columns.iter().any(|column| column.contains(self))
    }
}

/// Entity as it arrives from the feed. Every field is optional so a single
/// payload type covers full inserts and partial merges; which fields are
/// required depends on whether the id already exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenPayload {
    pub id: Option<String>,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub liquidity: Option<f64>,
    pub holder_count: Option<u64>,
    pub is_new: Option<bool>,
    pub is_final_stretch: Option<bool>,
    pub is_migrated: Option<bool>,
    pub timestamp: Option<i64>,
    pub color: Option<TokenColor>,
    pub contract_address: Option<String>,
    pub transaction_count: Option<u64>,
    pub fee: Option<f64>,
    pub percentage_changes: Option<Vec<PercentageChange>>,
    pub icon_count: Option<u32>,
    pub badge_count: Option<u32>,
    pub holder_ratio: Option<String>,
}

impl TokenPayload {
    pub fn identifier(&self) -> Result<&str, AppError> {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(AppError::MalformedEvent(
                "token payload is missing its id".to_string(),
            )),
        }
    }

    /// Checks the fields that are present; absent fields are not an error here.
    pub fn validate(&self) -> Result<(), AppError> {
        self.identifier()?;
        check_magnitude("price", self.price)?;
        check_finite("priceChange24h", self.price_change_24h)?;
        check_magnitude("volume24h", self.volume_24h)?;
        check_magnitude("marketCap", self.market_cap)?;
        check_magnitude("liquidity", self.liquidity)?;
        check_magnitude("fee", self.fee)?;
        if let Some(changes) = &self.percentage_changes {
            if changes.iter().any(|change| !change.value.is_finite()) {
                return Err(AppError::MalformedEvent(
                    "percentageChanges must contain finite values".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Overwrites every field present on the payload and carries the rest.
    /// The timestamp is left to the caller, which owns the freshness policy.
    pub fn merge_into(self, token: &mut Token) {
        if let Some(symbol) = self.symbol {
            token.symbol = symbol;
        }
        if let Some(name) = self.name {
            token.name = name;
        }
        if let Some(price) = self.price {
            token.price = price;
        }
        if let Some(change) = self.price_change_24h {
            token.price_change_24h = change;
        }
        if let Some(volume) = self.volume_24h {
            token.volume_24h = volume;
        }
        if let Some(market_cap) = self.market_cap {
            token.market_cap = market_cap;
        }
        if let Some(liquidity) = self.liquidity {
            token.liquidity = liquidity;
        }
        if let Some(holder_count) = self.holder_count {
            token.holder_count = holder_count;
        }
        if let Some(is_new) = self.is_new {
            token.is_new = is_new;
        }
        if let Some(is_final_stretch) = self.is_final_stretch {
            token.is_final_stretch = is_final_stretch;
        }
        if let Some(is_migrated) = self.is_migrated {
            token.is_migrated = is_migrated;
        }
        if self.color.is_some() {
            token.color = self.color;
        }
        if self.contract_address.is_some() {
            token.contract_address = self.contract_address;
        }
        if self.transaction_count.is_some() {
            token.transaction_count = self.transaction_count;
        }
        if self.fee.is_some() {
            token.fee = self.fee;
        }
        if self.percentage_changes.is_some() {
            token.percentage_changes = self.percentage_changes;
        }
        if self.icon_count.is_some() {
            token.icon_count = self.icon_count;
        }
        if self.badge_count.is_some() {
            token.badge_count = self.badge_count;
        }
        if self.holder_ratio.is_some() {
            token.holder_ratio = self.holder_ratio;
        }
        token.trend = Trend::from_change(token.price_change_24h);
    }
}

fn check_finite(field: &str, value: Option<f64>) -> Result<(), AppError> {
    match value {
        Some(number) if !number.is_finite() => Err(AppError::MalformedEvent(format!(
            "{field} must be a finite number"
        ))),
        _ => Ok(()),
    }
}

fn check_magnitude(field: &str, value: Option<f64>) -> Result<(), AppError> {
    match value {
        Some(number) if !number.is_finite() || number < 0.0 => Err(AppError::MalformedEvent(
            format!("{field} must be a finite non-negative number"),
        )),
        _ => Ok(()),
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, AppError> {
    value.ok_or_else(|| {
        AppError::MalformedEvent(format!("new token is missing required field '{field}'"))
    })
}

impl TryFrom<TokenPayload> for Token {
    type Error = AppError;

    fn try_from(value: TokenPayload) -> Result<Self, Self::Error> {
        value.validate()?;
        let id = value.identifier()?.to_string();
        let price_change_24h = require(value.price_change_24h, "priceChange24h")?;

        Ok(Self {
            id,
            symbol: require(value.symbol, "symbol")?,
            name: require(value.name, "name")?,
            price: require(value.price, "price")?,
            price_change_24h,
            volume_24h: require(value.volume_24h, "volume24h")?,
            market_cap: require(value.market_cap, "marketCap")?,
            liquidity: require(value.liquidity, "liquidity")?,
            holder_count: require(value.holder_count, "holderCount")?,
            is_new: require(value.is_new, "isNew")?,
            is_final_stretch: require(value.is_final_stretch, "isFinalStretch")?,
            is_migrated: require(value.is_migrated, "isMigrated")?,
            timestamp: require(value.timestamp, "timestamp")?,
            trend: Trend::from_change(price_change_24h),
            color: value.color,
            contract_address: value.contract_address,
            transaction_count: value.transaction_count,
            fee: value.fee,
            percentage_changes: value.percentage_changes,
            icon_count: value.icon_count,
            badge_count: value.badge_count,
            holder_ratio: value.holder_ratio,
        })
    }
}

impl From<Token> for TokenPayload {
    fn from(value: Token) -> Self {
        Self {
            id: Some(value.id),
            symbol: Some(value.symbol),
            name: Some(value.name),
            price: Some(value.price),
            price_change_24h: Some(value.price_change_24h),
            volume_24h: Some(value.volume_24h),
            market_cap: Some(value.market_cap),
            liquidity: Some(value.liquidity),
            holder_count: Some(value.holder_count),
            is_new: Some(value.is_new),
            is_final_stretch: Some(value.is_final_stretch),
            is_migrated: Some(value.is_migrated),
            timestamp: Some(value.timestamp),
            color: value.color,
            contract_address: value.contract_address,
            transaction_count: value.transaction_count,
            fee: value.fee,
            percentage_changes: value.percentage_changes,
            icon_count: value.icon_count,
            badge_count: value.badge_count,
            holder_ratio: value.holder_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub token_id: String,
    pub new_price: f64,
    pub change: f64,
    pub timestamp: i64,
}

impl PriceUpdate {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.token_id.trim().is_empty() {
            return Err(AppError::MalformedEvent(
                "price update is missing tokenId".to_string(),
            ));
        }
        if !self.new_price.is_finite() || self.new_price < 0.0 || !self.change.is_finite() {
            return Err(AppError::MalformedEvent(
                "newPrice must be finite and non-negative, change must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Data events carried by a feed link.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    InitialData(Vec<TokenPayload>),
    PriceUpdate(PriceUpdate),
    NewToken(TokenPayload),
    TokenRemoved(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedMessageWire {
    InitialData(Vec<TokenPayload>),
    PriceUpdate(PriceUpdate),
    NewToken(TokenPayload),
    TokenRemoved(String),
}

impl TryFrom<FeedMessageWire> for FeedEvent {
    type Error = AppError;

    fn try_from(value: FeedMessageWire) -> Result<Self, Self::Error> {
        match value {
            FeedMessageWire::InitialData(tokens) => Ok(Self::InitialData(tokens)),
            FeedMessageWire::PriceUpdate(update) => {
                update.validate()?;
                Ok(Self::PriceUpdate(update))
            }
            FeedMessageWire::NewToken(token) => Ok(Self::NewToken(token)),
            FeedMessageWire::TokenRemoved(id) => {
                let trimmed = id.trim();
                if trimmed.is_empty() {
                    return Err(AppError::MalformedEvent(
                        "token_removed carries an empty id".to_string(),
                    ));
                }
                Ok(Self::TokenRemoved(trimmed.to_string()))
            }
        }
    }
}

pub fn parse_feed_payload(payload: &mut [u8]) -> Result<FeedEvent, AppError> {
    let wire: FeedMessageWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

/// Inclusive numeric bounds, carried on the wire as `[min, max]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

impl NumericRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        !self.min.is_nan() && !self.max.is_nan() && self.min <= self.max
    }

    /// An invalid range restricts nothing.
    pub fn contains(&self, value: f64) -> bool {
        if !self.is_valid() {
            return true;
        }
        value >= self.min && value <= self.max
    }
}

impl From<[f64; 2]> for NumericRange {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<NumericRange> for [f64; 2] {
    fn from(value: NumericRange) -> Self {
        [value.min, value.max]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    Id,
    Symbol,
    Name,
    Price,
    PriceChange24h,
    Volume24h,
    MarketCap,
    Liquidity,
    HolderCount,
    Timestamp,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    pub search: String,
    pub price_range: NumericRange,
    pub volume_range: NumericRange,
    pub columns: Vec<ColumnKind>,
    pub sort_by: SortField,
    pub sort_direction: SortDirection,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            search: String::new(),
            price_range: DEFAULT_PRICE_RANGE,
            volume_range: DEFAULT_VOLUME_RANGE,
            columns: ColumnKind::ALL.to_vec(),
            sort_by: DEFAULT_SORT_FIELD,
            sort_direction: DEFAULT_SORT_DIRECTION,
        }
    }
}

/// Partial filter update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterPatch {
    pub search: Option<String>,
    pub price_range: Option<NumericRange>,
    pub volume_range: Option<NumericRange>,
    pub columns: Option<Vec<ColumnKind>>,
    pub sort_by: Option<SortField>,
    pub sort_direction: Option<SortDirection>,
}

impl FilterPatch {
    pub fn sort(field: SortField, direction: SortDirection) -> Self {
        Self {
            sort_by: Some(field),
            sort_direction: Some(direction),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub inserted: u64,
    pub merged: u64,
    pub removed: u64,
    pub ignored: u64,
    pub stale: u64,
    pub rejected: u64,
    pub recomputes: u64,
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub entities: Vec<Token>,
    pub projection: Vec<Token>,
    pub loading_state: LoadingState,
    pub error: Option<String>,
    pub filters: FilterState,
    pub stats: StoreStats,
}

impl StoreSnapshot {
    pub fn empty() -> Self {
        Self {
            entities: Vec::new(),
            projection: Vec::new(),
            loading_state: LoadingState::Idle,
            error: None,
            filters: FilterState::default(),
            stats: StoreStats::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorePerfSnapshot {
    pub t: i64,
    pub apply_p50_us: Option<u32>,
    pub apply_p95_us: Option<u32>,
    pub apply_p99_us: Option<u32>,
    pub recompute_p50_us: Option<u32>,
    pub recompute_p95_us: Option<u32>,
    pub recompute_p99_us: Option<u32>,
    pub apply_count: u64,
    pub recompute_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusSnapshot {
    pub state: SessionState,
    pub reconnect_attempt: u32,
    pub events_received: u64,
    pub reason: Option<String>,
}

impl SessionStatusSnapshot {
    pub fn disconnected(reason: Option<String>) -> Self {
        Self {
            state: SessionState::Disconnected,
            reconnect_attempt: 0,
            events_received: 0,
            reason,
        }
    }
}
