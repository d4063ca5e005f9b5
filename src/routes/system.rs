use crate::config::Config;
use crate::error::AppError;
use crate::store::Store;
use chrono::Utc;
use rocket::serde::json::Json;
use rocket::{State, get};
use std::sync::Arc;

/// `GET /api/v1/healthz`, unauthenticated liveness probe.
#[get("/healthz")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /api/v1/stats`, unauthenticated aggregate view: agent count and
/// heartbeat staleness.
#[get("/stats")]
pub fn stats(store: &State<Arc<dyn Store>>, config: &State<Config>) -> Result<Json<serde_json::Value>, AppError> {
    let agents = store.list_agents().map_err(|e| AppError::Internal(e.to_string()))?;
    let cutoff = Utc::now() - chrono::Duration::milliseconds(config.heartbeat_timeout_ms as i64);
    let stale = agents.iter().filter(|a| a.last_heartbeat < cutoff).count();
    Ok(Json(serde_json::json!({
        "agent_count": agents.len(),
        "stale_heartbeats": stale,
        "storage_backend": format!("{:?}", config.storage_backend),
    })))
}
