use crate::pulse::store::SharedTokenStore;
use crate::pulse::types::{SessionState, SessionStatusSnapshot};
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub session: SessionState,
    pub entities: usize,
    pub projection: usize,
}

pub fn build_health_response(
    started_at: Instant,
    session: &SessionStatusSnapshot,
    store: &SharedTokenStore,
) -> HealthResponse {
    let (entities, projection) =
        store.read(|readable| (readable.len(), readable.projection().len()));
    let status = match session.state {
        SessionState::Failed => "degraded",
        _ => "ok",
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        session: session.state,
        entities,
        projection,
    }
}

pub fn health(state: &AppState) -> HealthResponse {
    let session = state.feed_status.read().clone();
    build_health_response(state.started_at, &session, &state.store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::config::StoreOptions;
    use crate::pulse::types::tests::sample_token;

    #[test]
    fn health_reports_ok_status_and_store_counts() {
        let store = SharedTokenStore::new(StoreOptions::default());
        let mut listed = sample_token("listed", 1.0);
        listed.is_new = true;
        let unlisted = sample_token("unlisted", 2.0);
        store.apply_initial(vec![listed.into(), unlisted.into()]);
        let session = SessionStatusSnapshot::disconnected(None);

        let response = build_health_response(Instant::now(), &session, &store);

        assert_eq!(response.status, "ok");
        assert_eq!(response.session, SessionState::Disconnected);
        assert_eq!(response.entities, 2);
        assert_eq!(response.projection, 1);
        assert!(response.uptime_ms <= 1_000);
    }

    #[test]
    fn failed_session_degrades_health() {
        let store = SharedTokenStore::new(StoreOptions::default());
        let session = SessionStatusSnapshot {
            state: SessionState::Failed,
            ..SessionStatusSnapshot::disconnected(Some("retries exhausted".to_string()))
        };

        let response = build_health_response(Instant::now(), &session, &store);

        assert_eq!(response.status, "degraded");
        assert_eq!(response.entities, 0);
    }
}
