use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{GroupId, Role, UserId, DEFAULT_GROUP_ID},
    error::{ApiError, ErrorCode},
    protocol::{
        AckResponse, LoginResponse, MarkReadRequest, MemberSummary, MessagePayload,
        SendMessageRequest, SendMessageResponse, UserProfile, MESSAGE_PAGE_LIMIT,
        PRESENCE_WINDOW_SECONDS,
    },
};
use storage::{Storage, StoredMessage};
use tracing::{debug, info};

const AVATAR_BASE_URL: &str = "https://api.dicebear.com/7.x/avataaars/svg?seed=";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence_window: Duration,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            presence_window: Duration::seconds(PRESENCE_WINDOW_SECONDS),
        }
    }
}

pub fn avatar_url_for(name: &str) -> String {
    format!("{AVATAR_BASE_URL}{name}")
}

/// Logs in by display name, creating the user on first use and joining it to
/// the default group.
pub async fn login(
    ctx: &ApiContext,
    name: &str,
    now: DateTime<Utc>,
) -> Result<LoginResponse, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Name is required"));
    }

    let user = ctx
        .storage
        .find_or_create_user(name, &avatar_url_for(name), now)
        .await
        .map_err(internal)?;
    ctx.storage
        .touch_last_seen(user.user_id, now)
        .await
        .map_err(internal)?;
    ctx.storage
        .add_membership(DEFAULT_GROUP_ID, user.user_id, Role::Member, now)
        .await
        .map_err(internal)?;

    info!(user_id = user.user_id.0, name, "user logged in");
    Ok(LoginResponse {
        token: format!("user_{}_{}", user.user_id.0, now.timestamp_millis()),
        user: UserProfile {
            id: user.user_id,
            name: user.name,
            avatar_url: user.avatar_url,
            created_at: user.created_at,
        },
        message: "Login successful".to_string(),
    })
}

pub async fn heartbeat(
    ctx: &ApiContext,
    user_id: UserId,
    now: DateTime<Utc>,
) -> Result<AckResponse, ApiError> {
    let known = ctx
        .storage
        .touch_last_seen(user_id, now)
        .await
        .map_err(internal)?;
    if !known {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }
    Ok(AckResponse { ok: true })
}

pub async fn list_members(
    ctx: &ApiContext,
    group_id: GroupId,
    now: DateTime<Utc>,
) -> Result<Vec<MemberSummary>, ApiError> {
    ensure_group_exists(ctx, group_id).await?;
    let members = ctx
        .storage
        .list_members_for_group(group_id)
        .await
        .map_err(internal)?;

    Ok(members
        .into_iter()
        .map(|member| MemberSummary {
            id: member.user_id,
            name: member.name,
            avatar_url: Some(member.avatar_url),
            online: member
                .last_seen
                .is_some_and(|last_seen| now - last_seen < ctx.presence_window),
            last_seen: member.last_seen,
            role: member.role,
            joined_at: member.joined_at,
        })
        .collect())
}

pub async fn list_messages(
    ctx: &ApiContext,
    group_id: GroupId,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let messages = ctx
        .storage
        .list_group_messages(group_id, since, MESSAGE_PAGE_LIMIT)
        .await
        .map_err(internal)?;
    debug!(
        group_id = group_id.0,
        since = ?since,
        count = messages.len(),
        "listed messages"
    );
    Ok(messages.into_iter().map(to_payload).collect())
}

pub async fn send_message(
    ctx: &ApiContext,
    group_id: GroupId,
    request: SendMessageRequest,
    now: DateTime<Utc>,
) -> Result<SendMessageResponse, ApiError> {
    let text = request.text.trim();
    if text.is_empty() {
        return Err(ApiError::validation("Message text is required"));
    }
    let user_id = request
        .user_id
        .ok_or_else(|| ApiError::validation("User ID is required"))?;
    ensure_group_exists(ctx, group_id).await?;
    if ctx
        .storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }

    let message_id = ctx
        .storage
        .insert_message(group_id, user_id, text, request.is_anonymous, now)
        .await
        .map_err(internal)?;
    let stored = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::internal("message vanished after insert"))?;

    Ok(SendMessageResponse {
        message: to_payload(stored),
        temp_id: request.temp_id,
    })
}

pub async fn mark_read(
    ctx: &ApiContext,
    group_id: GroupId,
    request: MarkReadRequest,
) -> Result<AckResponse, ApiError> {
    if request.message_ids.is_empty() {
        return Err(ApiError::validation("Message IDs are required"));
    }
    let touched = ctx
        .storage
        .mark_read(group_id, &request.message_ids)
        .await
        .map_err(internal)?;
    debug!(group_id = group_id.0, touched, "marked messages read");
    Ok(AckResponse { ok: true })
}

async fn ensure_group_exists(ctx: &ApiContext, group_id: GroupId) -> Result<(), ApiError> {
    if ctx
        .storage
        .group_exists(group_id)
        .await
        .map_err(internal)?
    {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::NotFound, "group not found"))
    }
}

fn to_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: message.message_id,
        group_id: message.group_id,
        user_id: message.user_id,
        text: message.text,
        is_anonymous: message.is_anonymous,
        status: message.status,
        created_at: message.created_at,
        user_name: message.user_name,
        avatar_url: Some(message.avatar_url),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
