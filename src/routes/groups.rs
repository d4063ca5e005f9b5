use crate::auth;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::EventBus;
use crate::groups;
use crate::models::{AddMemberRequest, CreateGroupRequest, Group, GroupHistoryEntry, GroupRole, JoinGroupRequest, PostGroupMessageRequest};
use crate::store::Store;
use rocket::serde::json::Json;
use rocket::{Request, State, get, post};
use std::sync::Arc;

/// `POST /groups`, signed; the creator is taken from the signed agent, not
/// the request body, so a caller cannot create a group on another agent's behalf.
#[post("/groups", format = "json", data = "<body>")]
pub async fn create(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    body: Json<CreateGroupRequest>,
) -> AppResult<Json<Group>> {
    let signed = auth::authenticate_signed(req).await?;
    if body.created_by != signed.0.id {
        return Err(AppError::SubjectMismatchForbidden);
    }
    let group = groups::create(
        store.inner().as_ref(),
        body.name.clone(),
        body.created_by.clone(),
        body.access.clone(),
        body.settings.clone(),
    )?;
    Ok(Json(group))
}

/// `GET /groups/{id}`, signed; caller must be a member.
#[get("/groups/<id>")]
pub async fn get(req: &Request<'_>, store: &State<Arc<dyn Store>>, id: &str) -> AppResult<Json<Group>> {
    let signed = auth::authenticate_signed(req).await?;
    let group = store
        .get_group(id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("group {id} not found")))?;
    if !group.members.iter().any(|m| m.agent_id == signed.0.id) {
        return Err(AppError::Forbidden("caller is not a member".to_string()));
    }
    Ok(Json(group))
}

/// `POST /groups/{id}/members`, signed; admin only.
#[post("/groups/<id>/members", format = "json", data = "<body>")]
pub async fn add_member(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
    body: Json<AddMemberRequest>,
) -> AppResult<Json<Group>> {
    let signed = auth::authenticate_signed(req).await?;
    let group = groups::add_member(
        store.inner().as_ref(),
        id,
        &signed.0.id,
        body.agent_id.clone(),
        body.role.unwrap_or(GroupRole::Member),
    )?;
    Ok(Json(group))
}

/// `POST /groups/{id}/join`, signed.
#[post("/groups/<id>/join", format = "json", data = "<body>")]
pub async fn join(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
    body: Json<JoinGroupRequest>,
) -> AppResult<Json<Group>> {
    let signed = auth::authenticate_signed(req).await?;
    if body.agent_id != signed.0.id {
        return Err(AppError::SubjectMismatchForbidden);
    }
    let group = groups::join(store.inner().as_ref(), id, body.agent_id.clone(), body.key.as_deref())?;
    Ok(Json(group))
}

/// `POST /groups/{id}/leave`, signed.
#[post("/groups/<id>/leave")]
pub async fn leave(req: &Request<'_>, store: &State<Arc<dyn Store>>, id: &str) -> AppResult<Json<Group>> {
    let signed = auth::authenticate_signed(req).await?;
    let group = groups::leave(store.inner().as_ref(), id, &signed.0.id)?;
    Ok(Json(group))
}

/// `POST /groups/{id}/messages`, signed.
#[post("/groups/<id>/messages", format = "json", data = "<body>")]
pub async fn post_message(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    events: &State<EventBus>,
    config: &State<Config>,
    id: &str,
    body: Json<PostGroupMessageRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let signed = auth::authenticate_signed(req).await?;
    if body.from != signed.0.id {
        return Err(AppError::SubjectMismatchForbidden);
    }
    let message_id = groups::post(
        store.inner().as_ref(),
        events.inner(),
        config.inner(),
        id,
        &body.from,
        body.subject.clone(),
        body.body.clone(),
        body.ttl_sec,
    )?;
    Ok(Json(serde_json::json!({ "message_id": message_id })))
}

/// `GET /groups/{id}/messages?limit=N`, signed; only when `history_visible=true`.
#[get("/groups/<id>/messages?<limit>")]
pub async fn history(
    req: &Request<'_>,
    store: &State<Arc<dyn Store>>,
    id: &str,
    limit: Option<usize>,
) -> AppResult<Json<Vec<GroupHistoryEntry>>> {
    let signed = auth::authenticate_signed(req).await?;
    let entries = groups::list_history(store.inner().as_ref(), id, &signed.0.id, limit.unwrap_or(50))?;
    Ok(Json(entries))
}
