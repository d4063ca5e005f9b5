use super::{PullOutcome, Store, StoreError, StoreResult, TransitionOutcome};
use crate::models::{
    Agent, AgentPolicy, Envelope, Group, GroupAccess, GroupAccessType, GroupHistoryEntry,
    GroupMember, GroupRole, GroupSettings, MessageRecord, MessageStatus, PublicKeyEntry,
    RegistrationMode, WebhookAttempt, WebhookConfig,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

/// Durable backend. One connection behind a mutex, same shape as the
/// teacher's `Db`: every operation takes the lock, runs to completion, and
/// releases it. WAL keeps readers from blocking the writer across processes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn backend_err<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    pub fn new(path: &str) -> StoreResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(backend_err)?;
            }
        }
        let conn = Connection::open(path).map_err(backend_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(backend_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                registration_mode TEXT NOT NULL,
                webhook_url TEXT,
                webhook_secret TEXT,
                policy TEXT NOT NULL DEFAULT '{}',
                last_heartbeat TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                approved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_keys (
                agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                public_key BLOB NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                deactivate_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agent_keys_agent ON agent_keys(agent_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                recipient TEXT NOT NULL,
                envelope TEXT NOT NULL,
                idempotency_key TEXT,
                status TEXT NOT NULL,
                leased_by TEXT,
                lease_until TEXT,
                visible_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                delivered_at TEXT,
                acked_at TEXT,
                created_at TEXT NOT NULL,
                last_error TEXT,
                seq INTEGER NOT NULL,
                ttl_deadline TEXT,
                ephemeral INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_recipient_status_visible
                ON messages(recipient, status, visible_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_recipient_idemkey
                ON messages(recipient, idempotency_key)
                WHERE idempotency_key IS NOT NULL;

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_by TEXT NOT NULL,
                access TEXT NOT NULL,
                settings TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                agent_id TEXT NOT NULL,
                role TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (group_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS group_messages (
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                message_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_group_messages_group_created
                ON group_messages(group_id, created_at);

            CREATE TABLE IF NOT EXISTS webhook_attempts (
                message_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                attempt_no INTEGER NOT NULL DEFAULT 0,
                next_try TEXT NOT NULL,
                last_status INTEGER,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_webhook_attempts_next_try ON webhook_attempts(next_try);
            ",
        )
        .map_err(backend_err)?;

        conn.execute_batch("ALTER TABLE agents ADD COLUMN approved INTEGER NOT NULL DEFAULT 0;")
            .ok();

        Ok(())
    }

    fn load_agent_row(conn: &Connection, id: &str) -> rusqlite::Result<Option<Agent>> {
        let agent = conn
            .query_row(
                "SELECT id, kind, registration_mode, webhook_url, webhook_secret, policy,
                        last_heartbeat, metadata, approved, created_at
                 FROM agents WHERE id = ?1",
                [id],
                |row| {
                    let webhook_url: Option<String> = row.get(3)?;
                    let webhook_secret: Option<String> = row.get(4)?;
                    let policy_json: String = row.get(5)?;
                    let metadata_json: String = row.get(7)?;
                    let registration_mode_str: String = row.get(2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        registration_mode_str,
                        webhook_url,
                        webhook_secret,
                        policy_json,
                        row.get::<_, String>(6)?,
                        metadata_json,
                        row.get::<_, bool>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            kind,
            registration_mode_str,
            webhook_url,
            webhook_secret,
            policy_json,
            last_heartbeat_str,
            metadata_json,
            approved,
            created_at_str,
        )) = agent
        else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT public_key, active, deactivate_at FROM agent_keys WHERE agent_id = ?1")?;
        let keys = stmt
            .query_map([&id], |row| {
                let deactivate_at: Option<String> = row.get(2)?;
                Ok(PublicKeyEntry {
                    public_key: row.get(0)?,
                    active: row.get(1)?,
                    deactivate_at: deactivate_at
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let registration_mode = if registration_mode_str == "imported" {
            RegistrationMode::Imported
        } else {
            RegistrationMode::SelfRegistered
        };

        let webhook = match (webhook_url, webhook_secret) {
            (Some(url), Some(secret)) => Some(WebhookConfig { url, secret }),
            _ => None,
        };

        let policy: AgentPolicy = serde_json::from_str(&policy_json).unwrap_or_default();
        let metadata: serde_json::Value =
            serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);

        Ok(Some(Agent {
            id,
            kind,
            keys,
            registration_mode,
            webhook,
            policy,
            last_heartbeat: DateTime::parse_from_rfc3339(&last_heartbeat_str)
                .map_err(|_| rusqlite::Error::InvalidQuery)?
                .with_timezone(&Utc),
            metadata,
            approved,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map_err(|_| rusqlite::Error::InvalidQuery)?
                .with_timezone(&Utc),
        }))
    }

    fn save_agent_row(conn: &Connection, agent: &Agent) -> rusqlite::Result<()> {
        let registration_mode_str = match agent.registration_mode {
            RegistrationMode::SelfRegistered => "self_registered",
            RegistrationMode::Imported => "imported",
        };
        let (webhook_url, webhook_secret) = match &agent.webhook {
            Some(w) => (Some(w.url.clone()), Some(w.secret.clone())),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO agents (id, kind, registration_mode, webhook_url, webhook_secret,
                                  policy, last_heartbeat, metadata, approved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                registration_mode = excluded.registration_mode,
                webhook_url = excluded.webhook_url,
                webhook_secret = excluded.webhook_secret,
                policy = excluded.policy,
                last_heartbeat = excluded.last_heartbeat,
                metadata = excluded.metadata,
                approved = excluded.approved",
            params![
                agent.id,
                agent.kind,
                registration_mode_str,
                webhook_url,
                webhook_secret,
                serde_json::to_string(&agent.policy).unwrap_or_default(),
                agent.last_heartbeat.to_rfc3339(),
                serde_json::to_string(&agent.metadata).unwrap_or_default(),
                agent.approved,
                agent.created_at.to_rfc3339(),
            ],
        )?;
        conn.execute("DELETE FROM agent_keys WHERE agent_id = ?1", [&agent.id])?;
        for key in &agent.keys {
            conn.execute(
                "INSERT INTO agent_keys (agent_id, public_key, active, deactivate_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    agent.id,
                    key.public_key,
                    key.active,
                    key.deactivate_at.map(|d| d.to_rfc3339()),
                ],
            )?;
        }
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<MessageRecord> {
        let envelope_json: String = row.get("envelope")?;
        let envelope: Envelope =
            serde_json::from_str(&envelope_json).map_err(|_| rusqlite::Error::InvalidQuery)?;
        let status_str: String = row.get("status")?;
        let status = parse_status(&status_str);

        let parse_dt = |s: Option<String>| {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        Ok(MessageRecord {
            envelope,
            recipient: row.get("recipient")?,
            idempotency_key: row.get("idempotency_key")?,
            status,
            leased_by: row.get("leased_by")?,
            lease_until: parse_dt(row.get("lease_until")?),
            visible_at: parse_dt(row.get("visible_at")?),
            attempts: row.get("attempts")?,
            delivered_at: parse_dt(row.get("delivered_at")?),
            acked_at: parse_dt(row.get("acked_at")?),
            created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("created_at")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?
                .with_timezone(&Utc),
            last_error: row.get("last_error")?,
            seq: row.get("seq")?,
        })
    }

    fn save_message_row(conn: &Connection, m: &MessageRecord) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO messages (id, recipient, envelope, idempotency_key, status, leased_by,
                                    lease_until, visible_at, attempts, delivered_at, acked_at,
                                    created_at, last_error, seq, ttl_deadline, ephemeral)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                leased_by = excluded.leased_by,
                lease_until = excluded.lease_until,
                visible_at = excluded.visible_at,
                attempts = excluded.attempts,
                delivered_at = excluded.delivered_at,
                acked_at = excluded.acked_at,
                last_error = excluded.last_error,
                envelope = excluded.envelope",
            params![
                m.envelope.id,
                m.recipient,
                serde_json::to_string(&m.envelope).unwrap_or_default(),
                m.idempotency_key,
                status_str(m.status),
                m.leased_by,
                m.lease_until.map(|d| d.to_rfc3339()),
                m.visible_at.map(|d| d.to_rfc3339()),
                m.attempts,
                m.delivered_at.map(|d| d.to_rfc3339()),
                m.acked_at.map(|d| d.to_rfc3339()),
                m.created_at.to_rfc3339(),
                m.last_error,
                m.seq,
                m.ttl_deadline().map(|d| d.to_rfc3339()),
                m.envelope.ephemeral,
            ],
        )?;
        Ok(())
    }
}

fn status_str(status: MessageStatus) -> &'static str {
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

fn parse_status(s: &str) -> MessageStatus {
    match s {
        "delivered" => MessageStatus::Delivered,
        "leased" => MessageStatus::Leased,
        "acked" => MessageStatus::Acked,
        "nacked" => MessageStatus::Nacked,
        "failed" => MessageStatus::Failed,
        "dead" => MessageStatus::Dead,
        "expired" => MessageStatus::Expired,
        _ => MessageStatus::Queued,
    }
}

impl Store for SqliteStore {
    fn put_agent(&self, agent: Agent) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        Self::save_agent_row(&conn, &agent).map_err(backend_err)
    }

    fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        Self::load_agent_row(&conn, id).map_err(backend_err)
    }

    fn update_agent(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut Agent) -> StoreResult<()> + '_>,
    ) -> StoreResult<Agent> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut agent = Self::load_agent_row(&conn, id)
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(&mut agent)?;
        Self::save_agent_row(&conn, &agent).map_err(backend_err)?;
        Ok(agent)
    }

    fn delete_agent(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.execute("DELETE FROM agents WHERE id = ?1", [id])
            .map_err(backend_err)?;
        Ok(())
    }

    fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut stmt = conn.prepare("SELECT id FROM agents").map_err(backend_err)?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(backend_err)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(agent) = Self::load_agent_row(&conn, &id).map_err(backend_err)? {
                out.push(agent);
            }
        }
        Ok(out)
    }

    fn enqueue(&self, mut message: MessageRecord) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let next_seq: i64 = conn
            .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM messages", [], |r| r.get(0))
            .map_err(backend_err)?;
        message.seq = next_seq;
        Self::save_message_row(&conn, &message).map_err(backend_err)
    }

    fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.query_row("SELECT * FROM messages WHERE id = ?1", [id], Self::row_to_message)
            .optional()
            .map_err(backend_err)
    }

    fn find_by_idempotency_key(
        &self,
        recipient: &str,
        key: &str,
    ) -> StoreResult<Option<MessageRecord>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.query_row(
            "SELECT * FROM messages WHERE recipient = ?1 AND idempotency_key = ?2",
            params![recipient, key],
            Self::row_to_message,
        )
        .optional()
        .map_err(backend_err)
    }

    fn pull(
        &self,
        recipient: &str,
        leased_by: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<PullOutcome> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM messages
                 WHERE recipient = ?1 AND status = 'delivered'
                   AND (visible_at IS NULL OR visible_at <= ?2)
                 ORDER BY seq ASC LIMIT 1",
                params![recipient, now.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend_err)?;

        let Some(id) = id else {
            return Ok(PullOutcome::Empty);
        };

        conn.execute(
            "UPDATE messages SET status = 'leased', leased_by = ?1, lease_until = ?2,
                                  delivered_at = COALESCE(delivered_at, ?3)
             WHERE id = ?4",
            params![leased_by, lease_until.to_rfc3339(), now.to_rfc3339(), id],
        )
        .map_err(backend_err)?;

        let message = conn
            .query_row("SELECT * FROM messages WHERE id = ?1", [&id], Self::row_to_message)
            .map_err(backend_err)?;
        Ok(PullOutcome::Leased(message))
    }

    fn ack(&self, id: &str, leased_by: &str, purge_body: bool) -> StoreResult<TransitionOutcome> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let Some(mut message) = conn
            .query_row("SELECT * FROM messages WHERE id = ?1", [id], Self::row_to_message)
            .optional()
            .map_err(backend_err)?
        else {
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
        Self::save_message_row(&conn, &message).map_err(backend_err)?;
        Ok(TransitionOutcome::Applied(message))
    }

    fn nack(
        &self,
        id: &str,
        leased_by: &str,
        requeue_at: Option<DateTime<Utc>>,
        dead_letter: bool,
        error: Option<String>,
    ) -> StoreResult<TransitionOutcome> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let Some(mut message) = conn
            .query_row("SELECT * FROM messages WHERE id = ?1", [id], Self::row_to_message)
            .optional()
            .map_err(backend_err)?
        else {
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
        Self::save_message_row(&conn, &message).map_err(backend_err)?;
        Ok(TransitionOutcome::Applied(message))
    }

    fn list_inbox(
        &self,
        recipient: &str,
        status: Option<MessageStatus>,
    ) -> StoreResult<Vec<MessageRecord>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut stmt = match status {
            Some(_) => conn
                .prepare("SELECT * FROM messages WHERE recipient = ?1 AND status = ?2 ORDER BY seq ASC")
                .map_err(backend_err)?,
            None => conn
                .prepare("SELECT * FROM messages WHERE recipient = ?1 ORDER BY seq ASC")
                .map_err(backend_err)?,
        };
        let rows = if let Some(status) = status {
            stmt.query_map(params![recipient, status_str(status)], Self::row_to_message)
        } else {
            stmt.query_map(params![recipient], Self::row_to_message)
        }
        .map_err(backend_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend_err)
    }

    fn inbox_depth(&self, recipient: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND status = 'delivered'",
                [recipient],
                |r| r.get(0),
            )
            .map_err(backend_err)?;
        Ok(count as usize)
    }

    fn reclaim_expired_leases(&self, now: DateTime<Utc>, max_attempts: i64) -> StoreResult<i64> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let reclaimed = conn
            .execute(
                "UPDATE messages SET status = 'delivered', leased_by = NULL, lease_until = NULL,
                                      attempts = attempts + 1
                 WHERE status = 'leased' AND lease_until <= ?1 AND attempts < ?2",
                params![now.to_rfc3339(), max_attempts],
            )
            .map_err(backend_err)?;
        let dead = conn
            .execute(
                "UPDATE messages SET status = 'dead', leased_by = NULL, lease_until = NULL,
                                      last_error = 'max_lease_attempts_exceeded'
                 WHERE status = 'leased' AND lease_until <= ?1 AND attempts >= ?2",
                params![now.to_rfc3339(), max_attempts],
            )
            .map_err(backend_err)?;
        Ok((reclaimed + dead) as i64)
    }

    fn expire_ttl_messages(&self, now: DateTime<Utc>) -> StoreResult<i64> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, ephemeral FROM messages
                 WHERE status NOT IN ('acked', 'dead', 'expired') AND ttl_deadline IS NOT NULL AND ttl_deadline <= ?1",
            )
            .map_err(backend_err)?;
        let rows: Vec<(String, bool)> = stmt
            .query_map([now.to_rfc3339()], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(backend_err)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        for (id, ephemeral) in &rows {
            conn.execute(
                "UPDATE messages SET status = 'expired', leased_by = NULL, lease_until = NULL WHERE id = ?1",
                [id],
            )
            .map_err(backend_err)?;
            if *ephemeral {
                let envelope_json: String = conn
                    .query_row("SELECT envelope FROM messages WHERE id = ?1", [id], |r| r.get(0))
                    .map_err(backend_err)?;
                if let Ok(mut envelope) = serde_json::from_str::<Envelope>(&envelope_json) {
                    envelope.body = serde_json::Value::Null;
                    conn.execute(
                        "UPDATE messages SET envelope = ?1 WHERE id = ?2",
                        params![serde_json::to_string(&envelope).unwrap_or_default(), id],
                    )
                    .map_err(backend_err)?;
                }
            }
        }
        Ok(rows.len() as i64)
    }

    fn mark_stale_heartbeats(&self, older_than: DateTime<Utc>) -> StoreResult<i64> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM agents WHERE last_heartbeat < ?1",
                [older_than.to_rfc3339()],
                |r| r.get(0),
            )
            .map_err(backend_err)?;
        Ok(count)
    }

    fn put_group(&self, group: Group) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.execute(
            "INSERT INTO groups (id, name, created_by, access, settings, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, access=excluded.access,
                settings=excluded.settings, updated_at=excluded.updated_at",
            params![
                group.id,
                group.name,
                group.created_by,
                serde_json::to_string(&group.access).unwrap_or_default(),
                serde_json::to_string(&group.settings).unwrap_or_default(),
                group.created_at.to_rfc3339(),
                group.updated_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        conn.execute("DELETE FROM group_members WHERE group_id = ?1", [&group.id])
            .map_err(backend_err)?;
        for member in &group.members {
            conn.execute(
                "INSERT INTO group_members (group_id, agent_id, role, joined_at) VALUES (?1,?2,?3,?4)",
                params![
                    group.id,
                    member.agent_id,
                    match member.role {
                        GroupRole::Admin => "admin",
                        GroupRole::Member => "member",
                    },
                    member.joined_at.to_rfc3339(),
                ],
            )
            .map_err(backend_err)?;
        }
        Ok(())
    }

    fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        load_group(&conn, id).map_err(backend_err)
    }

    fn update_group(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut Group) -> StoreResult<()> + '_>,
    ) -> StoreResult<Group> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut group = load_group(&conn, id)
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(&mut group)?;
        group.updated_at = Utc::now();
        drop(conn);
        self.put_group(group.clone())?;
        Ok(group)
    }

    fn append_group_history(&self, entry: GroupHistoryEntry) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.execute(
            "INSERT INTO group_messages (group_id, message_id, sender, subject, body, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                entry.group_id,
                entry.message_id,
                entry.from,
                entry.subject,
                serde_json::to_string(&entry.body).unwrap_or_default(),
                entry.created_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        Ok(())
    }

    fn list_group_history(&self, group_id: &str, limit: usize) -> StoreResult<Vec<GroupHistoryEntry>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut stmt = conn
            .prepare(
                "SELECT group_id, message_id, sender, subject, body, created_at
                 FROM group_messages WHERE group_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(backend_err)?;
        let mut entries: Vec<GroupHistoryEntry> = stmt
            .query_map(params![group_id, limit as i64], |row| {
                let body_json: String = row.get(4)?;
                Ok(GroupHistoryEntry {
                    group_id: row.get(0)?,
                    message_id: row.get(1)?,
                    from: row.get(2)?,
                    subject: row.get(3)?,
                    body: serde_json::from_str(&body_json).unwrap_or(serde_json::Value::Null),
                    created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(5)?)
                        .map_err(|_| rusqlite::Error::InvalidQuery)?
                        .with_timezone(&Utc),
                })
            })
            .map_err(backend_err)?
            .filter_map(|r| r.ok())
            .collect();
        entries.reverse();
        Ok(entries)
    }

    fn enqueue_webhook_attempt(&self, attempt: WebhookAttempt) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        conn.execute(
            "INSERT INTO webhook_attempts (message_id, agent_id, endpoint, attempt_no, next_try, last_status, last_error)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(message_id) DO UPDATE SET next_try = excluded.next_try",
            params![
                attempt.message_id,
                attempt.agent_id,
                attempt.endpoint,
                attempt.attempt_no,
                attempt.next_try.to_rfc3339(),
                attempt.last_status,
                attempt.last_error,
            ],
        )
        .map_err(backend_err)?;
        Ok(())
    }

    fn due_webhook_attempts(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<WebhookAttempt>> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        let mut stmt = conn
            .prepare(
                "SELECT message_id, agent_id, endpoint, attempt_no, next_try, last_status, last_error
                 FROM webhook_attempts WHERE next_try <= ?1 ORDER BY next_try ASC LIMIT ?2",
            )
            .map_err(backend_err)?;
        stmt.query_map(params![now.to_rfc3339(), limit as i64], |row| {
            Ok(WebhookAttempt {
                message_id: row.get(0)?,
                agent_id: row.get(1)?,
                endpoint: row.get(2)?,
                attempt_no: row.get(3)?,
                next_try: DateTime::parse_from_rfc3339(&row.get::<_, String>(4)?)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                last_status: row.get(5)?,
                last_error: row.get(6)?,
            })
        })
        .map_err(backend_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(backend_err)
    }

    fn record_webhook_result(
        &self,
        message_id: &str,
        success: bool,
        status: Option<u16>,
        error: Option<String>,
        next_try: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| backend_err("lock poisoned"))?;
        if success || next_try.is_none() {
            conn.execute("DELETE FROM webhook_attempts WHERE message_id = ?1", [message_id])
                .map_err(backend_err)?;
            return Ok(());
        }
        conn.execute(
            "UPDATE webhook_attempts SET attempt_no = attempt_no + 1, last_status = ?1,
                                          last_error = ?2, next_try = ?3
             WHERE message_id = ?4",
            params![status, error, next_try.unwrap().to_rfc3339(), message_id],
        )
        .map_err(backend_err)?;
        Ok(())
    }
}

fn load_group(conn: &Connection, id: &str) -> rusqlite::Result<Option<Group>> {
    let base = conn
        .query_row(
            "SELECT id, name, created_by, access, settings, created_at, updated_at FROM groups WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, name, created_by, access_json, settings_json, created_at, updated_at)) = base else {
        return Ok(None);
    };

    let access: GroupAccess = serde_json::from_str(&access_json).unwrap_or(GroupAccess {
        kind: GroupAccessType::Open,
        join_key_hash: None,
    });
    let settings: GroupSettings = serde_json::from_str(&settings_json).unwrap_or_default();

    let mut stmt = conn.prepare("SELECT agent_id, role, joined_at FROM group_members WHERE group_id = ?1")?;
    let members = stmt
        .query_map([&id], |row| {
            let role_str: String = row.get(1)?;
            Ok(GroupMember {
                agent_id: row.get(0)?,
                role: if role_str == "admin" { GroupRole::Admin } else { GroupRole::Member },
                joined_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(2)?)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Some(Group {
        id,
        name,
        created_by,
        access,
        settings,
        members,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
    }))
}
