use crate::auth::{self, ApiKeyHeader};
use crate::config::Config;
use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, RelayEvent};
use crate::models::{
    Agent, AgentPolicy, PublicKeyEntry, RegisterAgentRequest, RegisterAgentResponse,
    RegistrationMode, SetWebhookRequest, WebhookConfig,
};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::store::Store;
use chrono::Utc;
use rocket::serde::json::Json;
use rocket::{Request, State, delete, get, post};
use std::sync::Arc;

/// `POST /agents/register`, per §4.3: `secret_key` is only returned when the
/// relay generated the keypair, never when the caller supplied `public_key`.
#[post("/agents/register", format = "json", data = "<body>")]
pub async fn register(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    events: &State<EventBus>,
    config: &State<Config>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    api_key: ApiKeyHeader,
    body: Json<RegisterAgentRequest>,
) -> AppResult<Json<RegisterAgentResponse>> {
    auth::check_api_key(config, api_key.0.as_deref())?;
    limiter.check(
        &format!("register:{}", body.agent_id),
        rate_config.register_max,
        rate_config.register_window_secs,
    )?;
    let _ = req;

    if body.agent_id.trim().is_empty() {
        return Err(AppError::Validation("agent_id is required".to_string()));
    }
    if store
        .get_agent(&body.agent_id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "agent {} already registered",
            body.agent_id
        )));
    }

    let (public_key_b64, secret_key_b64, public_key_bytes) = match &body.public_key {
        Some(supplied) => {
            let bytes = crypto::b64_decode(supplied).map_err(AppError::Validation)?;
            crypto::verifying_key_from_bytes(&bytes).map_err(AppError::Validation)?;
            (crypto::b64_encode(&bytes), None, bytes)
        }
        None => {
            let (signing_key, verifying_key) = crypto::generate_keypair();
            (
                crypto::b64_encode(verifying_key.as_bytes()),
                Some(crypto::b64_encode(&signing_key.to_bytes())),
                verifying_key.as_bytes().to_vec(),
            )
        }
    };

    let now = Utc::now();
    let agent = Agent {
        id: body.agent_id.clone(),
        kind: body.kind.clone(),
        keys: vec![PublicKeyEntry {
            public_key: public_key_bytes,
            active: true,
            deactivate_at: None,
        }],
        registration_mode: RegistrationMode::SelfRegistered,
        webhook: None,
        policy: AgentPolicy::default(),
        last_heartbeat: now,
        metadata: body.metadata.clone().unwrap_or(serde_json::Value::Null),
        approved: true,
        created_at: now,
    };
    store
        .put_agent(agent.clone())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    events.publish(RelayEvent::AgentRegistered(agent.clone()));

    Ok(Json(RegisterAgentResponse {
        agent_id: agent.id,
        public_key: public_key_b64,
        secret_key: secret_key_b64,
        registration_mode: agent.registration_mode,
    }))
}

/// `DELETE /agents/{id}`, signed; the signer must be the subject.
#[delete("/agents/<id>")]
pub async fn deregister(req: &Request<'_>, store: &State<Arc<dyn Store>>, id: &str) -> AppResult<()> {
    auth::require_subject_match(req, id).await?;
    store.delete_agent(id).map_err(|e| AppError::Internal(e.to_string()))
}

/// `POST /agents/{id}/heartbeat`, signed; refreshes `last_heartbeat`.
#[post("/agents/<id>/heartbeat")]
pub async fn heartbeat(req: &Request<'_>, store: &State<Arc<dyn Store>>, id: &str) -> AppResult<()> {
    auth::require_subject_match(req, id).await?;
    store
        .update_agent(
            id,
            Box::new(|agent| {
                agent.last_heartbeat = Utc::now();
                Ok(())
            }),
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(())
}

/// `POST /agents/{id}/rotate-key`, signed; begins the grace window by adding a
/// new active key and scheduling the old one for deactivation after the
/// signature freshness window so in-flight requests signed with it still verify.
#[post("/agents/<id>/rotate-key", format = "json", data = "<body>")]
pub async fn rotate_key(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
    body: Json<RegisterAgentRequest>,
) -> AppResult<Json<RegisterAgentResponse>> {
    auth::require_subject_match(req, id).await?;

    let (public_key_b64, secret_key_b64, public_key_bytes) = match &body.public_key {
        Some(supplied) => {
            let bytes = crypto::b64_decode(supplied).map_err(AppError::Validation)?;
            crypto::verifying_key_from_bytes(&bytes).map_err(AppError::Validation)?;
            (crypto::b64_encode(&bytes), None, bytes)
        }
        None => {
            let (signing_key, verifying_key) = crypto::generate_keypair();
            (
                crypto::b64_encode(verifying_key.as_bytes()),
                Some(crypto::b64_encode(&signing_key.to_bytes())),
                verifying_key.as_bytes().to_vec(),
            )
        }
    };

    let grace_deadline = Utc::now() + chrono::Duration::seconds(crypto::FRESHNESS_WINDOW_SECS);
    let agent = store
        .update_agent(
            id,
            Box::new(move |agent| {
                for key in agent.keys.iter_mut() {
                    if key.active {
                        key.active = false;
                        key.deactivate_at = Some(grace_deadline);
                    }
                }
                agent.keys.push(PublicKeyEntry {
                    public_key: public_key_bytes,
                    active: true,
                    deactivate_at: None,
                });
                Ok(())
            }),
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(RegisterAgentResponse {
        agent_id: agent.id,
        public_key: public_key_b64,
        secret_key: secret_key_b64,
        registration_mode: agent.registration_mode,
    }))
}

/// `POST /agents/{id}/webhook`, signed.
#[post("/agents/<id>/webhook", format = "json", data = "<body>")]
pub async fn set_webhook(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
    body: Json<SetWebhookRequest>,
) -> AppResult<()> {
    auth::require_subject_match(req, id).await?;
    let url = body.url.clone();
    let secret = body.secret.clone();
    store
        .update_agent(
            id,
            Box::new(move |agent| {
                agent.webhook = Some(WebhookConfig { url, secret });
                Ok(())
            }),
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(())
}

/// `GET /agents/{id}/webhook`, signed; secret is never echoed back.
#[get("/agents/<id>/webhook")]
pub async fn get_webhook(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
) -> AppResult<Json<serde_json::Value>> {
    auth::require_subject_match(req, id).await?;
    let agent = store
        .get_agent(id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("agent {id} not found")))?;
    match agent.webhook {
        Some(webhook) => Ok(Json(serde_json::json!({ "url": webhook.url }))),
        None => Err(AppError::NotFound("no webhook configured".to_string())),
    }
}

/// `DELETE /agents/{id}/webhook`, signed.
#[delete("/agents/<id>/webhook")]
pub async fn delete_webhook(req: &Request<'_>, store: &State<Arc<dyn Store>>, id: &str) -> AppResult<()> {
    auth::require_subject_match(req, id).await?;
    store
        .update_agent(
            id,
            Box::new(|agent| {
                agent.webhook = None;
                Ok(())
            }),
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(())
}

/// `POST /agents/{id}/approve`, operator-gated via the master API key: approves
/// a shadow agent created by federated DID resolution (§4.3 rule 8).
#[post("/agents/<id>/approve")]
pub async fn approve(
    store: &State<Arc<dyn Store>>,
    config: &State<Config>,
    api_key: ApiKeyHeader,
    id: &str,
) -> AppResult<()> {
    auth::check_api_key(config, api_key.0.as_deref())?;
    store
        .update_agent(
            id,
            Box::new(|agent| {
                agent.approved = true;
                Ok(())
            }),
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(())
}

/// `GET /agents/{id}/inbox/stats`, signed.
#[get("/agents/<id>/inbox/stats")]
pub async fn inbox_stats(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
) -> AppResult<Json<crate::models::InboxStats>> {
    auth::require_subject_match(req, id).await?;
    crate::lifecycle::inbox_stats(store.inner().as_ref(), id).map(Json)
}
