use crate::crypto;
use crate::events::{EventBus, RelayEvent};
use crate::models::WebhookAttempt;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const MAX_WEBHOOK_ATTEMPTS: i64 = 8;
const BASE_BACKOFF_SECS: i64 = 2;
const MAX_BACKOFF_SECS: i64 = 300;

/// Subscribes to the event bus and, for every delivered message whose
/// recipient has a webhook configured, enqueues a `WebhookAttempt` record.
/// The actual HTTP delivery happens in the webhook-retry control loop, not
/// here — this keeps dispatch identity (the row) visible to operators
/// instead of living inside an opaque spawned task.
pub fn spawn_enqueuer(events: &EventBus, store: Arc<dyn Store>) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(RelayEvent::MessageDelivered(message)) => {
                    let Ok(Some(agent)) = store.get_agent(&message.recipient) else {
                        continue;
                    };
                    let Some(webhook) = agent.webhook else {
                        continue;
                    };
                    let attempt = WebhookAttempt {
                        message_id: message.envelope.id.clone(),
                        agent_id: message.recipient.clone(),
                        endpoint: webhook.url,
                        attempt_no: 0,
                        next_try: Utc::now(),
                        last_status: None,
                        last_error: None,
                    };
                    if let Err(e) = store.enqueue_webhook_attempt(attempt) {
                        tracing::warn!(error = %e, "failed to enqueue webhook attempt");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "webhook enqueuer lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// One tick of the webhook-retry control loop: pulls attempts whose
/// `next_try <= now`, delivers each, and schedules backoff or exhaustion.
pub async fn run_due_attempts(
    store: &dyn Store,
    client: &reqwest::Client,
    batch_size: usize,
) -> usize {
    let now = Utc::now();
    let due = match store.due_webhook_attempts(now, batch_size) {
        Ok(due) => due,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load due webhook attempts");
            return 0;
        }
    };

    for attempt in &due {
        deliver_one(store, client, attempt).await;
    }
    due.len()
}

async fn deliver_one(store: &dyn Store, client: &reqwest::Client, attempt: &WebhookAttempt) {
    let Ok(Some(message)) = store.get_message(&attempt.message_id) else {
        let _ = store.record_webhook_result(&attempt.message_id, true, None, None, None);
        return;
    };

    let body = serde_json::to_vec(&message.envelope).unwrap_or_default();
    let Ok(Some(agent)) = store.get_agent(&attempt.agent_id) else {
        let _ = store.record_webhook_result(&attempt.message_id, true, None, None, None);
        return;
    };
    let Some(webhook) = &agent.webhook else {
        let _ = store.record_webhook_result(&attempt.message_id, true, None, None, None);
        return;
    };

    let mut request = client
        .post(&attempt.endpoint)
        .header("Content-Type", "application/json");
    if let Some(sig) = crypto::hmac_sha256_hex(&webhook.secret, &body) {
        request = request.header("X-Admp-Signature", format!("sha256={sig}"));
    }

    let result = request.body(body).send().await;

    match result {
        Ok(response) if response.status().is_success() => {
            let _ = store.record_webhook_result(&attempt.message_id, true, Some(response.status().as_u16()), None, None);
        }
        Ok(response) => {
            let status = response.status();
            let code = status.as_u16();
            let retryable = status.is_server_error() || code == 408 || code == 429;
            if !retryable {
                let _ = store.record_webhook_result(
                    &attempt.message_id,
                    false,
                    Some(code),
                    Some(format!("non-retryable status {code}")),
                    None,
                );
                return;
            }
            schedule_retry_or_exhaust(store, attempt, Some(code), format!("status {code}"));
        }
        Err(e) => {
            schedule_retry_or_exhaust(store, attempt, None, e.to_string());
        }
    }
}

fn schedule_retry_or_exhaust(
    store: &dyn Store,
    attempt: &WebhookAttempt,
    status: Option<u16>,
    error: String,
) {
    let next_attempt_no = attempt.attempt_no + 1;
    if next_attempt_no >= MAX_WEBHOOK_ATTEMPTS {
        tracing::warn!(
            message_id = %attempt.message_id,
            agent_id = %attempt.agent_id,
            "webhook delivery exhausted retries"
        );
        let _ = store.record_webhook_result(&attempt.message_id, false, status, Some(error), None);
        return;
    }
    let backoff = (BASE_BACKOFF_SECS.pow(next_attempt_no as u32)).min(MAX_BACKOFF_SECS);
    let next_try = Utc::now() + chrono::Duration::seconds(backoff);
    let _ = store.record_webhook_result(&attempt.message_id, false, status, Some(error), Some(next_try));
}

pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build webhook HTTP client")
}
