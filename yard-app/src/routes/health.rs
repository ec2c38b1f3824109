use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let route = state.router.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_turns": state.turns.active_count(),
        "channels": state.channels,
        "route": {
            "mode": route.mode,
            "active_model": route.active_model,
            "switch_epoch": route.switch_epoch,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::{FailoverPolicy, FailoverRouter};
    use crate::testing::FakeFactory;
    use crate::turns::TurnRegistry;
    use std::time::Instant;

    #[tokio::test]
    async fn health_reports_route_and_turns() {
        let state = Arc::new(AppState {
            started_at: Instant::now(),
            router: Arc::new(FailoverRouter::new(
                "gpt-4o",
                &[],
                FailoverPolicy::default(),
                FakeFactory::with(vec![]),
                None,
            )),
            turns: TurnRegistry::new(),
            channels: vec!["webchat".to_string()],
        });
        let Json(body) = get_health(Extension(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_turns"], 0);
        assert_eq!(body["channels"][0], "webchat");
        assert_eq!(body["route"]["mode"], "normal");
        assert_eq!(body["route"]["active_model"], "gpt-4o");
    }
}
