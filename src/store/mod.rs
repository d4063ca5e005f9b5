pub mod memory;
pub mod sqlite;

use crate::models::{
    Agent, Group, GroupHistoryEntry, MessageRecord, MessageStatus, WebhookAttempt,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a `pull`: either a message was leased, or the inbox is empty.
pub enum PullOutcome {
    Leased(MessageRecord),
    Empty,
}

/// Outcome of an atomic status transition guarded by the caller's expected
/// current status (used by ack/nack so a stale lease can't double-apply).
pub enum TransitionOutcome {
    Applied(MessageRecord),
    Stale,
    NotFound,
}

#[derive(Debug, Default, Clone)]
pub struct ReclaimReport {
    pub leases_reclaimed: i64,
    pub messages_expired: i64,
    pub agents_marked_unreachable: i64,
}

/// Single storage interface behind both the in-memory and SQLite backends.
/// Every lifecycle-affecting method must be atomic with respect to concurrent
/// callers: `pull`/`ack`/`nack` race against each other and against the
/// control loops, and the contract is that exactly one caller wins.
pub trait Store: Send + Sync {
    // Agents
    fn put_agent(&self, agent: Agent) -> StoreResult<()>;
    fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>>;
    fn update_agent(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut Agent) -> StoreResult<()> + '_>,
    ) -> StoreResult<Agent>;
    fn delete_agent(&self, id: &str) -> StoreResult<()>;
    fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    // Messages
    fn enqueue(&self, message: MessageRecord) -> StoreResult<()>;
    fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>>;
    fn find_by_idempotency_key(
        &self,
        recipient: &str,
        key: &str,
    ) -> StoreResult<Option<MessageRecord>>;
    /// Atomically lease the oldest eligible message for `recipient` (status
    /// `delivered`, `visible_at <= now`), transitioning it to `leased`.
    fn pull(
        &self,
        recipient: &str,
        leased_by: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<PullOutcome>;
    /// Transition a `leased` message to `acked`, only if still leased by `leased_by`.
    fn ack(&self, id: &str, leased_by: &str, purge_body: bool) -> StoreResult<TransitionOutcome>;
    /// Release or dead-letter a `leased` message, only if still leased by `leased_by`.
    fn nack(
        &self,
        id: &str,
        leased_by: &str,
        requeue_at: Option<DateTime<Utc>>,
        dead_letter: bool,
        error: Option<String>,
    ) -> StoreResult<TransitionOutcome>;
    fn list_inbox(
        &self,
        recipient: &str,
        status: Option<MessageStatus>,
    ) -> StoreResult<Vec<MessageRecord>>;
    fn inbox_depth(&self, recipient: &str) -> StoreResult<usize>;

    // Control-loop sweeps
    fn reclaim_expired_leases(&self, now: DateTime<Utc>, max_attempts: i64) -> StoreResult<i64>;
    fn expire_ttl_messages(&self, now: DateTime<Utc>) -> StoreResult<i64>;
    fn mark_stale_heartbeats(&self, older_than: DateTime<Utc>) -> StoreResult<i64>;

    // Groups
    fn put_group(&self, group: Group) -> StoreResult<()>;
    fn get_group(&self, id: &str) -> StoreResult<Option<Group>>;
    fn update_group(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut Group) -> StoreResult<()> + '_>,
    ) -> StoreResult<Group>;
    fn append_group_history(&self, entry: GroupHistoryEntry) -> StoreResult<()>;
    fn list_group_history(&self, group_id: &str, limit: usize) -> StoreResult<Vec<GroupHistoryEntry>>;

    // Webhooks
    fn enqueue_webhook_attempt(&self, attempt: WebhookAttempt) -> StoreResult<()>;
    fn due_webhook_attempts(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<WebhookAttempt>>;
    fn record_webhook_result(
        &self,
        message_id: &str,
        success: bool,
        status: Option<u16>,
        error: Option<String>,
        next_try: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
}
