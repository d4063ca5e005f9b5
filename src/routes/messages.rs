use crate::auth::{self, ApiKeyHeader};
use crate::config::Config;
use crate::error::AppResult;
use crate::events::EventBus;
use crate::lifecycle;
use crate::models::{AckRequest, Envelope, NackRequest, PullRequest, PulledMessage, SendResponse};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::store::Store;
use rocket::serde::json::Json;
use rocket::{Request, State, get, post};
use std::sync::Arc;

/// `POST /agents/{to}/messages`, per §6.1: API-key gated, idempotent on the
/// `Idempotency-Key` header.
#[post("/agents/<to>/messages", format = "json", data = "<body>")]
pub async fn send(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    events: &State<EventBus>,
    config: &State<Config>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    api_key: ApiKeyHeader,
    to: &str,
    mut body: Json<Envelope>,
) -> AppResult<(rocket::http::Status, Json<SendResponse>)> {
    auth::check_api_key(config, api_key.0.as_deref())?;
    limiter.check(&format!("send:{to}"), rate_config.send_max, rate_config.send_window_secs)?;

    body.to = to.to_string();
    let idempotency_key = req
        .headers()
        .get_one("Idempotency-Key")
        .map(|s| s.to_string());

    let (message_id, status) = lifecycle::send(
        store.inner().as_ref(),
        events.inner(),
        config.inner(),
        body.into_inner(),
        idempotency_key,
    )?;
    Ok((rocket::http::Status::Created, Json(SendResponse { message_id, status })))
}

/// `POST /agents/{id}/inbox/pull`, signed; returns `204` on an empty inbox.
#[post("/agents/<id>/inbox/pull", format = "json", data = "<body>")]
pub async fn pull(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    config: &State<Config>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    id: &str,
    body: Json<PullRequest>,
) -> AppResult<Option<Json<PulledMessage>>> {
    auth::require_subject_match(req, id).await?;
    limiter.check(&format!("pull:{id}"), rate_config.pull_max, rate_config.pull_window_secs)?;

    let pulled = lifecycle::pull(store.inner().as_ref(), config.inner(), id, body.visibility_timeout_secs)?;
    Ok(pulled.map(|m| {
        Json(PulledMessage {
            envelope: m.envelope,
            status: m.status,
            lease_until: m.lease_until,
            attempts: m.attempts,
        })
    }))
}

/// `POST /agents/{id}/messages/{mid}/ack`, signed.
#[post("/agents/<id>/messages/<mid>/ack", format = "json", data = "<_body>")]
pub async fn ack(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    events: &State<EventBus>,
    id: &str,
    mid: &str,
    _body: Json<AckRequest>,
) -> AppResult<()> {
    auth::require_subject_match(req, id).await?;
    lifecycle::ack(store.inner().as_ref(), events.inner(), id, mid)
}

/// `POST /agents/{id}/messages/{mid}/nack`, signed.
#[post("/agents/<id>/messages/<mid>/nack", format = "json", data = "<body>")]
pub async fn nack(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    events: &State<EventBus>,
    config: &State<Config>,
    id: &str,
    mid: &str,
    body: Json<NackRequest>,
) -> AppResult<()> {
    auth::require_subject_match(req, id).await?;
    lifecycle::nack(
        store.inner().as_ref(),
        events.inner(),
        config.inner(),
        id,
        mid,
        body.delay_secs,
        body.dead_letter,
    )
}

/// `POST /agents/{id}/messages/{mid}/reply`, signed; `to`/`correlation_id` are
/// derived from the original message.
#[post("/agents/<id>/messages/<mid>/reply", format = "json", data = "<body>")]
pub async fn reply(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    events: &State<EventBus>,
    config: &State<Config>,
    id: &str,
    mid: &str,
    body: Json<Envelope>,
) -> AppResult<Json<SendResponse>> {
    auth::require_subject_match(req, id).await?;
    let (message_id, status) = lifecycle::reply(
        store.inner().as_ref(),
        events.inner(),
        config.inner(),
        id,
        mid,
        body.into_inner(),
    )?;
    Ok(Json(SendResponse { message_id, status }))
}

/// `GET /messages/{mid}/status`, API-key gated; surfaces `410 gone` for purged
/// ephemeral records per §4.4.7.
#[get("/messages/<mid>/status")]
pub async fn status(
    store: &State<Arc<dyn Store>>,
    config: &State<Config>,
    api_key: ApiKeyHeader,
    mid: &str,
) -> AppResult<Json<serde_json::Value>> {
    auth::check_api_key(config.inner(), api_key.0.as_deref())?;
    let message = lifecycle::get_message_for_status(store.inner().as_ref(), mid)?;
    Ok(Json(serde_json::json!({
        "message_id": message.envelope.id,
        "status": message.status,
        "attempts": message.attempts,
        "delivered_at": message.delivered_at,
        "acked_at": message.acked_at,
    })))
}
