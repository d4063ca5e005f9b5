use crate::config::Config;
use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::events::EventBus;
use crate::lifecycle;
use crate::models::{
    Envelope, Group, GroupAccess, GroupAccessType, GroupHistoryEntry, GroupMember, GroupRole,
    GroupSettings,
};
use crate::store::Store;
use chrono::Utc;

/// `create`, per §4.5: creator becomes admin.
pub fn create(
    store: &dyn Store,
    name: String,
    created_by: String,
    access: Option<GroupAccess>,
    settings: Option<GroupSettings>,
) -> AppResult<Group> {
    let now = Utc::now();
    let group = Group {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        created_by: created_by.clone(),
        access: access.unwrap_or(GroupAccess {
            kind: GroupAccessType::Open,
            join_key_hash: None,
        }),
        settings: settings.unwrap_or_default(),
        members: vec![GroupMember {
            agent_id: created_by,
            role: GroupRole::Admin,
            joined_at: now,
        }],
        created_at: now,
        updated_at: now,
    };
    store
        .put_group(group.clone())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(group)
}

fn get_or_404(store: &dyn Store, group_id: &str) -> AppResult<Group> {
    store
        .get_group(group_id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("group {group_id} not found")))
}

fn require_admin(group: &Group, agent_id: &str) -> AppResult<()> {
    let is_admin = group
        .members
        .iter()
        .any(|m| m.agent_id == agent_id && m.role == GroupRole::Admin);
    if !is_admin {
        return Err(AppError::Forbidden("admin role required".to_string()));
    }
    Ok(())
}

/// `add_member`, admin only.
pub fn add_member(
    store: &dyn Store,
    group_id: &str,
    caller: &str,
    agent_id: String,
    role: GroupRole,
) -> AppResult<Group> {
    store
        .update_group(
            group_id,
            Box::new(move |group| {
                require_admin(group, caller).map_err(|e| crate::store::StoreError::Backend(e.to_string()))?;
                if group.members.iter().any(|m| m.agent_id == agent_id) {
                    return Err(crate::store::StoreError::Conflict(format!(
                        "{agent_id} is already a member"
                    )));
                }
                if group.members.len() >= group.settings.max_members {
                    return Err(crate::store::StoreError::Conflict("group is full".to_string()));
                }
                group.members.push(GroupMember {
                    agent_id,
                    role,
                    joined_at: Utc::now(),
                });
                Ok(())
            }),
        )
        .map_err(store_err_to_app)
}

/// `remove_member`, admin only.
pub fn remove_member(store: &dyn Store, group_id: &str, caller: &str, agent_id: &str) -> AppResult<Group> {
    store
        .update_group(
            group_id,
            Box::new(move |group| {
                require_admin(group, caller).map_err(|e| crate::store::StoreError::Backend(e.to_string()))?;
                group.members.retain(|m| m.agent_id != agent_id);
                Ok(())
            }),
        )
        .map_err(store_err_to_app)
}

/// `join`, respecting the group's access mode.
pub fn join(store: &dyn Store, group_id: &str, agent_id: String, key: Option<&str>) -> AppResult<Group> {
    store
        .update_group(
            group_id,
            Box::new(move |group| {
                if group.members.iter().any(|m| m.agent_id == agent_id) {
                    return Ok(());
                }
                match group.access.kind {
                    GroupAccessType::Open => {}
                    GroupAccessType::KeyProtected => {
                        let hash = group.access.join_key_hash.as_deref().unwrap_or("");
                        let provided = key.unwrap_or("");
                        if crypto::sha256_hex(provided.as_bytes()) != hash {
                            return Err(crate::store::StoreError::Backend(
                                "invalid join key".to_string(),
                            ));
                        }
                    }
                    GroupAccessType::InviteOnly => {
                        return Err(crate::store::StoreError::Backend(
                            "group is invite-only".to_string(),
                        ));
                    }
                }
                if group.members.len() >= group.settings.max_members {
                    return Err(crate::store::StoreError::Conflict("group is full".to_string()));
                }
                group.members.push(GroupMember {
                    agent_id,
                    role: GroupRole::Member,
                    joined_at: Utc::now(),
                });
                Ok(())
            }),
        )
        .map_err(store_err_to_app)
}

/// `leave`.
pub fn leave(store: &dyn Store, group_id: &str, agent_id: &str) -> AppResult<Group> {
    store
        .update_group(
            group_id,
            Box::new(move |group| {
                group.members.retain(|m| m.agent_id != agent_id);
                Ok(())
            }),
        )
        .map_err(store_err_to_app)
}

/// `post(group, envelope)`, per §4.5: the membership snapshot is read once
/// before fan-out, so members added mid-dispatch never receive this post.
pub fn post(
    store: &dyn Store,
    events: &EventBus,
    config: &Config,
    group_id: &str,
    from: &str,
    subject: String,
    body: serde_json::Value,
    ttl_sec: Option<i64>,
) -> AppResult<String> {
    let group = get_or_404(store, group_id)?;
    if !group.members.iter().any(|m| m.agent_id == from) {
        return Err(AppError::Forbidden("sender is not a member".to_string()));
    }

    let message_id = uuid::Uuid::new_v4().to_string();
    if group.settings.history_visible {
        store
            .append_group_history(GroupHistoryEntry {
                group_id: group_id.to_string(),
                message_id: message_id.clone(),
                from: from.to_string(),
                subject: subject.clone(),
                body: body.clone(),
                created_at: Utc::now(),
            })
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }

    let effective_ttl = ttl_sec.or(group.settings.message_ttl_sec);
    for member in &group.members {
        if member.agent_id == from {
            continue;
        }
        let envelope = Envelope {
            version: "1".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            kind: "group_message".to_string(),
            from: from.to_string(),
            to: member.agent_id.clone(),
            subject: subject.clone(),
            correlation_id: Some(message_id.clone()),
            headers: Some(serde_json::json!({"group_id": group_id})),
            body: body.clone(),
            timestamp: Utc::now(),
            ttl_sec: effective_ttl,
            ephemeral: false,
            signature: None,
        };
        // Fan-out failures for one member must not block delivery to others.
        if let Err(e) = lifecycle::send(store, events, config, envelope, None) {
            tracing::warn!(group_id, member = %member.agent_id, error = %e, "group fan-out failed for member");
        }
    }

    Ok(message_id)
}

/// `list_history(group, limit)`, only when `history_visible=true` and the
/// caller is a member.
pub fn list_history(
    store: &dyn Store,
    group_id: &str,
    caller: &str,
    limit: usize,
) -> AppResult<Vec<GroupHistoryEntry>> {
    let group = get_or_404(store, group_id)?;
    if !group.members.iter().any(|m| m.agent_id == caller) {
        return Err(AppError::Forbidden("caller is not a member".to_string()));
    }
    if !group.settings.history_visible {
        return Err(AppError::Forbidden("history is disabled for this group".to_string()));
    }
    store
        .list_group_history(group_id, limit)
        .map_err(|e| AppError::Internal(e.to_string()))
}

fn store_err_to_app(e: crate::store::StoreError) -> AppError {
    match e {
        crate::store::StoreError::NotFound(s) => AppError::NotFound(s),
        crate::store::StoreError::Conflict(s) => AppError::Conflict(s),
        crate::store::StoreError::Backend(s) => AppError::Forbidden(s),
    }
}
