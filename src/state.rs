use crate::pulse::config::StoreOptions;
use crate::pulse::pipeline::{FeedHandle, StatusStore};
use crate::pulse::store::SharedTokenStore;
use crate::pulse::types::SessionStatusSnapshot;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AppState {
    pub started_at: Instant,
    pub store: SharedTokenStore,
    pub feed: Mutex<Option<FeedHandle>>,
    pub feed_status: StatusStore,
}

impl AppState {
    pub fn new(options: StoreOptions) -> Self {
        let feed_status =
            SessionStatusSnapshot::disconnected(Some("feed idle".to_string()));

        Self {
            started_at: Instant::now(),
            store: SharedTokenStore::new(options),
            feed: Mutex::new(None),
            feed_status: Arc::new(RwLock::new(feed_status)),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}
