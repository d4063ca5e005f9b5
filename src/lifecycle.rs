use crate::config::Config;
use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, RelayEvent};
use crate::models::{Envelope, MessageRecord, MessageStatus};
use crate::store::{PullOutcome, Store, TransitionOutcome};
use chrono::{DateTime, Utc};

/// `send(envelope, idempotency_key?) -> message_id`, per §4.4.1: atomic insert
/// at `status=delivered`, idempotent on `(recipient, idempotency_key)`,
/// enforcing the recipient's policy and, when `from` resolves locally, the
/// envelope signature.
pub fn send(
    store: &dyn Store,
    events: &EventBus,
    config: &Config,
    mut envelope: Envelope,
    idempotency_key: Option<String>,
) -> AppResult<(String, MessageStatus)> {
    validate_envelope(&envelope, config)?;

    let recipient = envelope.to.clone();
    if let Some(key) = &idempotency_key
        && let Some(existing) = store
            .find_by_idempotency_key(&recipient, key)
            .map_err(|e| AppError::Internal(e.to_string()))?
    {
        return Ok((existing.envelope.id, existing.status));
    }

    let recipient_agent = store
        .get_agent(&recipient)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("agent {recipient} not found")))?;

    if !recipient_agent.policy.trusted_senders.is_empty()
        && !recipient_agent.policy.trusted_senders.contains(&envelope.from)
    {
        return Err(AppError::PolicyViolation(format!(
            "{} is not a trusted sender for {}",
            envelope.from, recipient
        )));
    }
    if !recipient_agent.policy.allowed_subjects.is_empty()
        && !recipient_agent
            .policy
            .allowed_subjects
            .contains(&envelope.subject)
    {
        return Err(AppError::PolicyViolation(format!(
            "subject {} is not allowed for {}",
            envelope.subject, recipient
        )));
    }

    if let Some(sig) = &envelope.signature
        && let Ok(Some(sender_agent)) = store.get_agent(&envelope.from)
    {
        let body_bytes = serde_json::to_vec(&envelope.body).unwrap_or_default();
        let signing_string = crypto::envelope_signing_string(
            &envelope.timestamp,
            &body_bytes,
            &envelope.from,
            &envelope.to,
            envelope.correlation_id.as_deref(),
        );
        let sig_bytes = crypto::b64_decode(&sig.sig).map_err(AppError::MalformedSignature)?;
        let signature =
            crypto::signature_from_bytes(&sig_bytes).map_err(AppError::MalformedSignature)?;
        let verified = sender_agent.keys.iter().any(|k| {
            crypto::verifying_key_from_bytes(&k.public_key)
                .map(|vk| crypto::verify(&vk, signing_string.as_bytes(), &signature))
                .unwrap_or(false)
        });
        if !verified {
            return Err(AppError::SignatureInvalid);
        }
    }

    let depth = store
        .inbox_depth(&recipient)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if depth >= config.max_messages_per_agent {
        return Err(AppError::InboxFull);
    }

    if envelope.id.is_empty() {
        envelope.id = uuid::Uuid::new_v4().to_string();
    }
    envelope.ttl_sec = envelope.ttl_sec.or(Some(config.message_ttl_sec));
    let now = Utc::now();
    let message = MessageRecord {
        envelope: envelope.clone(),
        recipient: recipient.clone(),
        idempotency_key,
        status: MessageStatus::Delivered,
        leased_by: None,
        lease_until: None,
        visible_at: None,
        attempts: 0,
        delivered_at: Some(now),
        acked_at: None,
        created_at: now,
        last_error: None,
        seq: 0,
    };
    store
        .enqueue(message.clone())
        .map_err(|e| AppError::Internal(e.to_string()))?;

    events.publish(RelayEvent::MessageDelivered(message.clone()));

    Ok((envelope.id, MessageStatus::Delivered))
}

fn validate_envelope(envelope: &Envelope, config: &Config) -> AppResult<()> {
    if envelope.from.is_empty() || envelope.to.is_empty() {
        return Err(AppError::Validation("from and to are required".to_string()));
    }
    if envelope.kind.is_empty() {
        return Err(AppError::Validation("type is required".to_string()));
    }
    let size = serde_json::to_vec(envelope).map(|b| b.len()).unwrap_or(0);
    if size as u64 > config.max_message_size_kb * 1024 {
        return Err(AppError::PayloadTooLarge);
    }
    if !crypto::is_fresh(&envelope.timestamp, &Utc::now()) {
        return Err(AppError::Validation("timestamp not fresh".to_string()));
    }
    Ok(())
}

const MIN_VISIBILITY_TIMEOUT_SECS: u64 = 1;
const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 3600;

/// `pull(agent, visibility_timeout) -> message | empty`, per §4.4.2.
pub fn pull(
    store: &dyn Store,
    config: &Config,
    agent_id: &str,
    visibility_timeout_secs: Option<u64>,
) -> AppResult<Option<MessageRecord>> {
    let timeout = visibility_timeout_secs
        .unwrap_or(config.default_visibility_timeout_secs)
        .clamp(MIN_VISIBILITY_TIMEOUT_SECS, MAX_VISIBILITY_TIMEOUT_SECS);

    let now = Utc::now();
    let lease_until = now + chrono::Duration::seconds(timeout as i64);

    match store
        .pull(agent_id, agent_id, lease_until, now)
        .map_err(|e| AppError::Internal(e.to_string()))?
    {
        PullOutcome::Leased(message) => Ok(Some(message)),
        PullOutcome::Empty => Ok(None),
    }
}

/// `ack(agent, message_id, result?)`, per §4.4.3.
pub fn ack(store: &dyn Store, events: &EventBus, agent_id: &str, message_id: &str) -> AppResult<()> {
    let existing = store
        .get_message(message_id)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let Some(existing) = existing else {
        return Err(AppError::NotFound(format!("message {message_id} not found")));
    };
    let purge_body = existing.envelope.ephemeral;

    match store
        .ack(message_id, agent_id, purge_body)
        .map_err(|e| AppError::Internal(e.to_string()))?
    {
        TransitionOutcome::Applied(message) => {
            events.publish(RelayEvent::MessageAcked(message));
            Ok(())
        }
        TransitionOutcome::Stale => Err(AppError::Conflict(
            "message is not leased by this agent".to_string(),
        )),
        TransitionOutcome::NotFound => Err(AppError::NotFound(format!(
            "message {message_id} not found"
        ))),
    }
}

/// `nack(agent, message_id, {delay?, dead_letter?})`, per §4.4.4.
pub fn nack(
    store: &dyn Store,
    events: &EventBus,
    config: &Config,
    agent_id: &str,
    message_id: &str,
    delay_secs: Option<u64>,
    dead_letter: bool,
) -> AppResult<()> {
    let existing = store
        .get_message(message_id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("message {message_id} not found")))?;

    let force_dead = dead_letter || existing.attempts >= config.max_attempts;
    let requeue_at = if force_dead {
        None
    } else {
        Some(Utc::now() + chrono::Duration::seconds(delay_secs.unwrap_or(0) as i64))
    };

    match store
        .nack(message_id, agent_id, requeue_at, force_dead, None)
        .map_err(|e| AppError::Internal(e.to_string()))?
    {
        TransitionOutcome::Applied(message) => {
            if force_dead {
                events.publish(RelayEvent::MessageDead(message));
            }
            Ok(())
        }
        TransitionOutcome::Stale => Err(AppError::Conflict(
            "message is not leased by this agent".to_string(),
        )),
        TransitionOutcome::NotFound => Err(AppError::NotFound(format!(
            "message {message_id} not found"
        ))),
    }
}

/// `reply(original_message_id, envelope)`, per §4.4.5: `to`/`correlation_id`
/// are derived from the original, after confirming `caller` owns it.
pub fn reply(
    store: &dyn Store,
    events: &EventBus,
    config: &Config,
    caller: &str,
    original_message_id: &str,
    mut envelope: Envelope,
) -> AppResult<(String, MessageStatus)> {
    let original = store
        .get_message(original_message_id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("message {original_message_id} not found")))?;

    if original.recipient != caller {
        return Err(AppError::Forbidden(
            "caller does not own the original message".to_string(),
        ));
    }

    envelope.to = original.envelope.from;
    envelope.correlation_id = Some(
        original
            .envelope
            .correlation_id
            .unwrap_or(original.envelope.id),
    );

    send(store, events, config, envelope, None)
}

/// Computes the inbox-wide counts surfaced by `GET /agents/{id}/inbox/stats`.
pub fn inbox_stats(store: &dyn Store, agent_id: &str) -> AppResult<crate::models::InboxStats> {
    let all = store
        .list_inbox(agent_id, None)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let mut counts = std::collections::HashMap::new();
    let mut oldest_pending: Option<DateTime<Utc>> = None;
    for message in &all {
        *counts.entry(status_label(message.status).to_string()).or_insert(0) += 1;
        if matches!(message.status, MessageStatus::Delivered | MessageStatus::Leased)
            && oldest_pending.map(|o| message.created_at < o).unwrap_or(true)
        {
            oldest_pending = Some(message.created_at);
        }
    }
    Ok(crate::models::InboxStats {
        agent_id: agent_id.to_string(),
        counts,
        oldest_pending_age_secs: oldest_pending.map(|t| (Utc::now() - t).num_seconds()),
    })
}

fn status_label(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Queued => "queued",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Leased => "leased",
        MessageStatus::Acked => "acked",
        MessageStatus::Nacked => "nacked",
        MessageStatus::Failed => "failed",
        MessageStatus::Dead => "dead",
        MessageStatus::Expired => "expired",
    }
}

/// Surfaces `410 Gone` for purged ephemeral records per §4.4.7, otherwise the
/// record as-is.
pub fn get_message_for_status(store: &dyn Store, message_id: &str) -> AppResult<MessageRecord> {
    let message = store
        .get_message(message_id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("message {message_id} not found")))?;
    if message.status == MessageStatus::Expired && message.envelope.ephemeral {
        return Err(AppError::Gone);
    }
    Ok(message)
}
