use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/failover", get(get_failover))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_failover(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let router = &state.router;
    let policy = router.policy();
    Json(serde_json::json!({
        "enabled": policy.enabled,
        "primary_model": router.primary_model(),
        "fallback_chain": router.fallback_chain(),
        "probe_success_threshold": policy.probe_success_threshold,
        "switchback_requires_approval": policy.switchback_requires_approval,
        "probe_due": router.should_probe(),
        "state": router.snapshot(),
    }))
}
