use super::{PullOutcome, Store, StoreError, StoreResult, TransitionOutcome};
use crate::models::{
    Agent, Group, GroupHistoryEntry, MessageRecord, MessageStatus, WebhookAttempt,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Dev/test backend: everything lives behind one mutex, matching the
/// single-writer-at-a-time shape the SQLite backend gets from its connection
/// mutex. Not meant for production traffic, only for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, Agent>,
    messages: HashMap<String, MessageRecord>,
    seq: i64,
    groups: HashMap<String, Group>,
    group_history: HashMap<String, Vec<GroupHistoryEntry>>,
    webhook_attempts: HashMap<String, WebhookAttempt>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl Store for MemoryStore {
    fn put_agent(&self, agent: Agent) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner.agents.get(id).cloned())
    }

    fn update_agent(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut Agent) -> StoreResult<()> + '_>,
    ) -> StoreResult<Agent> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let agent = inner
            .agents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(agent)?;
        Ok(agent.clone())
    }

    fn delete_agent(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner.agents.remove(id);
        Ok(())
    }

    fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner.agents.values().cloned().collect())
    }

    fn enqueue(&self, mut message: MessageRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner.seq += 1;
        message.seq = inner.seq;
        inner.messages.insert(message.envelope.id.clone(), message);
        Ok(())
    }

    fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner.messages.get(id).cloned())
    }

    fn find_by_idempotency_key(
        &self,
        recipient: &str,
        key: &str,
    ) -> StoreResult<Option<MessageRecord>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner
            .messages
            .values()
            .find(|m| {
                m.recipient == recipient && m.idempotency_key.as_deref() == Some(key)
            })
            .cloned())
    }

    fn pull(
        &self,
        recipient: &str,
        leased_by: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<PullOutcome> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let candidate_id = inner
            .messages
            .values()
            .filter(|m| {
                m.recipient == recipient
                    && m.status == MessageStatus::Delivered
                    && m.visible_at.map(|v| v <= now).unwrap_or(true)
            })
            .min_by_key(|m| m.seq)
            .map(|m| m.envelope.id.clone());

        let Some(id) = candidate_id else {
            return Ok(PullOutcome::Empty);
        };
        let message = inner.messages.get_mut(&id).expect("candidate exists");
        message.status = MessageStatus::Leased;
        message.leased_by = Some(leased_by.to_string());
        message.lease_until = Some(lease_until);
        if message.delivered_at.is_none() {
            message.delivered_at = Some(now);
        }
        Ok(PullOutcome::Leased(message.clone()))
    }

    fn ack(&self, id: &str, leased_by: &str, purge_body: bool) -> StoreResult<TransitionOutcome> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let Some(message) = inner.messages.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if message.status != MessageStatus::Leased || message.leased_by.as_deref() != Some(leased_by) {
            return Ok(TransitionOutcome::Stale);
        }
        message.status = MessageStatus::Acked;
        message.acked_at = Some(Utc::now());
        if purge_body {
            message.envelope.body = serde_json::Value::Null;
        }
        Ok(TransitionOutcome::Applied(message.clone()))
    }

    fn nack(
        &self,
        id: &str,
        leased_by: &str,
        requeue_at: Option<DateTime<Utc>>,
        dead_letter: bool,
        error: Option<String>,
    ) -> StoreResult<TransitionOutcome> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let Some(message) = inner.messages.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if message.status != MessageStatus::Leased || message.leased_by.as_deref() != Some(leased_by) {
            return Ok(TransitionOutcome::Stale);
        }
        message.leased_by = None;
        message.lease_until = None;
        message.last_error = error;
        if dead_letter {
            message.status = MessageStatus::Dead;
        } else {
            message.status = MessageStatus::Delivered;
            message.visible_at = requeue_at;
            message.attempts += 1;
        }
        Ok(TransitionOutcome::Applied(message.clone()))
    }

    fn list_inbox(
        &self,
        recipient: &str,
        status: Option<MessageStatus>,
    ) -> StoreResult<Vec<MessageRecord>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut out: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| m.recipient == recipient && status.map(|s| s == m.status).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.seq);
        Ok(out)
    }

    fn inbox_depth(&self, recipient: &str) -> StoreResult<usize> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.recipient == recipient && m.status == MessageStatus::Delivered)
            .count())
    }

    fn reclaim_expired_leases(&self, now: DateTime<Utc>, max_attempts: i64) -> StoreResult<i64> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut reclaimed = 0;
        for message in inner.messages.values_mut() {
            if message.status == MessageStatus::Leased
                && message.lease_until.map(|l| l <= now).unwrap_or(false)
            {
                if message.attempts >= max_attempts {
                    message.status = MessageStatus::Dead;
                    message.last_error = Some("max_lease_attempts_exceeded".to_string());
                } else {
                    message.status = MessageStatus::Delivered;
                    message.attempts += 1;
                }
                message.leased_by = None;
                message.lease_until = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn expire_ttl_messages(&self, now: DateTime<Utc>) -> StoreResult<i64> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut expired = 0;
        for message in inner.messages.values_mut() {
            if matches!(
                message.status,
                MessageStatus::Acked | MessageStatus::Dead | MessageStatus::Expired
            ) {
                continue;
            }
            if let Some(deadline) = message.ttl_deadline() {
                if deadline <= now {
                    message.status = MessageStatus::Expired;
                    message.leased_by = None;
                    message.lease_until = None;
                    if message.envelope.ephemeral {
                        message.envelope.body = serde_json::Value::Null;
                    }
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    fn mark_stale_heartbeats(&self, older_than: DateTime<Utc>) -> StoreResult<i64> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner
            .agents
            .values()
            .filter(|a| a.last_heartbeat < older_than)
            .count() as i64)
    }

    fn put_group(&self, group: Group) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner.groups.insert(group.id.clone(), group);
        Ok(())
    }

    fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner.groups.get(id).cloned())
    }

    fn update_group(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut Group) -> StoreResult<()> + '_>,
    ) -> StoreResult<Group> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let group = inner
            .groups
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(group)?;
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    fn append_group_history(&self, entry: GroupHistoryEntry) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner
            .group_history
            .entry(entry.group_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn list_group_history(&self, group_id: &str, limit: usize) -> StoreResult<Vec<GroupHistoryEntry>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut entries = inner.group_history.get(group_id).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.created_at);
        if entries.len() > limit {
            let start = entries.len() - limit;
            entries = entries.split_off(start);
        }
        Ok(entries)
    }

    fn enqueue_webhook_attempt(&self, attempt: WebhookAttempt) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner
            .webhook_attempts
            .insert(attempt.message_id.clone(), attempt);
        Ok(())
    }

    fn due_webhook_attempts(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<WebhookAttempt>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut due: Vec<WebhookAttempt> = inner
            .webhook_attempts
            .values()
            .filter(|a| a.next_try <= now)
            .cloned()
            .collect();
        due.sort_by_key(|a| a.next_try);
        due.truncate(limit);
        Ok(due)
    }

    fn record_webhook_result(
        &self,
        message_id: &str,
        success: bool,
        status: Option<u16>,
        error: Option<String>,
        next_try: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        if success {
            inner.webhook_attempts.remove(message_id);
            return Ok(());
        }
        if let Some(attempt) = inner.webhook_attempts.get_mut(message_id) {
            attempt.attempt_no += 1;
            attempt.last_status = status;
            attempt.last_error = error;
            if let Some(next) = next_try {
                attempt.next_try = next;
            } else {
                inner.webhook_attempts.remove(message_id);
            }
        }
        Ok(())
    }
}
