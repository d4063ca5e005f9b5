use serde::{Deserialize, Serialize};

// --- Agents ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    SelfRegistered,
    Imported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyEntry {
    pub public_key: Vec<u8>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivate_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPolicy {
    #[serde(default)]
    pub trusted_senders: Vec<String>,
    #[serde(default)]
    pub allowed_subjects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub kind: String,
    pub keys: Vec<PublicKeyEntry>,
    pub registration_mode: RegistrationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    pub policy: AgentPolicy,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub metadata: serde_json::Value,
    /// Shadow agents created via DID-like resolution require operator approval
    /// before they may act as the subject of a lifecycle operation.
    pub approved: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// --- Envelope (wire) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub alg: String,
    pub kid: String,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    pub body: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_sec: Option<i64>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<EnvelopeSignature>,
}

// --- Message record (persisted) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Reserved for a pre-acceptance buffer (e.g. federated transport). Never
    /// produced by the HTTP API: `send` enqueues directly at `Delivered`.
    Queued,
    Delivered,
    Leased,
    Acked,
    Nacked,
    Failed,
    Dead,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub envelope: Envelope,
    pub recipient: String,
    pub idempotency_key: Option<String>,
    pub status: MessageStatus,
    pub leased_by: Option<String>,
    pub lease_until: Option<chrono::DateTime<chrono::Utc>>,
    pub visible_at: Option<chrono::DateTime<chrono::Utc>>,
    pub attempts: i64,
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub acked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_error: Option<String>,
    /// Monotonic insertion counter, used as a FIFO tiebreaker within a recipient.
    pub seq: i64,
}

impl MessageRecord {
    pub fn ttl_deadline(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.envelope
            .ttl_sec
            .map(|secs| self.created_at + chrono::Duration::seconds(secs))
    }
}

// --- Groups ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupAccessType {
    Open,
    InviteOnly,
    KeyProtected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAccess {
    #[serde(rename = "type")]
    pub kind: GroupAccessType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_key_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub history_visible: bool,
    pub max_members: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_ttl_sec: Option<i64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            history_visible: true,
            max_members: 256,
            message_ttl_sec: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub agent_id: String,
    pub role: GroupRole,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub access: GroupAccess,
    pub settings: GroupSettings,
    pub members: Vec<GroupMember>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHistoryEntry {
    pub group_id: String,
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub body: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// --- Webhook attempts ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAttempt {
    pub message_id: String,
    pub agent_id: String,
    pub endpoint: String,
    pub attempt_no: i64,
    pub next_try: chrono::DateTime<chrono::Utc>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

// --- Request/response DTOs ---

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// When set, the caller supplies their own Ed25519 public key (base64) instead
    /// of having the relay generate a keypair.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_kind() -> String {
    "generic".to_string()
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub agent_id: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub registration_mode: RegistrationMode,
}

#[derive(Debug, Deserialize)]
pub struct SetWebhookRequest {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub message_id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PulledMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub status: MessageStatus,
    pub lease_until: Option<chrono::DateTime<chrono::Utc>>,
    pub attempts: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct AckRequest {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NackRequest {
    #[serde(default)]
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub dead_letter: bool,
}

#[derive(Debug, Serialize)]
pub struct InboxStats {
    pub agent_id: String,
    pub counts: std::collections::HashMap<String, i64>,
    pub oldest_pending_age_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub created_by: String,
    #[serde(default)]
    pub access: Option<GroupAccess>,
    #[serde(default)]
    pub settings: Option<GroupSettings>,
}

#[derive(Debug, Deserialize)]
pub struct JoinGroupRequest {
    pub agent_id: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub agent_id: String,
    #[serde(default)]
    pub role: Option<GroupRole>,
}

#[derive(Debug, Deserialize)]
pub struct PostGroupMessageRequest {
    pub from: String,
    pub subject: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub ttl_sec: Option<i64>,
}
