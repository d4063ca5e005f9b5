use crate::config::Config;
use crate::events::EventBus;
use crate::store::Store;
use crate::webhooks;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const WEBHOOK_BATCH_SIZE: usize = 50;

/// Reclaims leases past `lease_until`, per §4.4.6. Safe under concurrent
/// pulls because the store's transition is conditional on the current
/// lease state, not on a snapshot taken here.
pub fn spawn_lease_reclaim(store: Arc<dyn Store>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.lease_reclaim_interval_sec));
        loop {
            interval.tick().await;
            match store.reclaim_expired_leases(Utc::now(), config.max_attempts) {
                Ok(n) if n > 0 => tracing::debug!(reclaimed = n, "lease-reclaim loop ran"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "lease-reclaim loop failed"),
            }
        }
    });
}

/// Expires records past their TTL, per §4.4.7.
pub fn spawn_ttl_sweep(store: Arc<dyn Store>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(config.cleanup_interval_ms));
        loop {
            interval.tick().await;
            match store.expire_ttl_messages(Utc::now()) {
                Ok(n) if n > 0 => tracing::debug!(expired = n, "ttl-sweep loop ran"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "ttl-sweep loop failed"),
            }
        }
    });
}

/// Marks agents offline once their heartbeat is older than
/// `heartbeat_timeout_ms`, per §4.7. Currently surfaced via `GET
/// /api/v1/stats`; the store itself only reports the stale count.
pub fn spawn_heartbeat_timeout(store: Arc<dyn Store>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(config.heartbeat_interval_ms));
        loop {
            interval.tick().await;
            let cutoff = Utc::now() - chrono::Duration::milliseconds(config.heartbeat_timeout_ms as i64);
            match store.mark_stale_heartbeats(cutoff) {
                Ok(n) if n > 0 => tracing::debug!(stale = n, "heartbeat-timeout loop observed stale agents"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "heartbeat-timeout loop failed"),
            }
        }
    });
}

/// Drives webhook delivery attempts whose `next_try <= now`, per §4.6/§4.7.
pub fn spawn_webhook_retry(store: Arc<dyn Store>) {
    tokio::spawn(async move {
        let client = webhooks::build_client();
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            webhooks::run_due_attempts(store.as_ref(), &client, WEBHOOK_BATCH_SIZE).await;
        }
    });
}

/// Starts the full set of control loops plus the webhook enqueuer, each an
/// interval-driven sweep against the shared `Store` trait.
pub fn spawn_all(store: Arc<dyn Store>, config: Arc<Config>, events: &EventBus) {
    webhooks::spawn_enqueuer(events, store.clone());
    spawn_lease_reclaim(store.clone(), config.clone());
    spawn_ttl_sweep(store.clone(), config.clone());
    spawn_heartbeat_timeout(store.clone(), config);
    spawn_webhook_retry(store);
}
