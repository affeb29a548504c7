pub mod buckets;
pub mod config;
pub mod pipeline;
pub mod query;
pub mod session;
pub mod simulator;
pub mod store;
pub mod types;
pub mod websocket;

pub const INITIAL_DATA_EVENT: &str = "initial_data";
pub const PRICE_UPDATE_EVENT: &str = "price_update";
pub const NEW_TOKEN_EVENT: &str = "new_token";
pub const TOKEN_REMOVED_EVENT: &str = "token_removed";
pub const CONNECTED_EVENT: &str = "connected";
pub const DISCONNECTED_EVENT: &str = "disconnected";
pub const RECONNECTING_EVENT: &str = "reconnecting";
pub const ERROR_EVENT: &str = "error";
