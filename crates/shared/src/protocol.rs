use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryStatus, GroupId, MessageId, Role, UserId};

/// Upper bound on messages returned by one list call.
pub const MESSAGE_PAGE_LIMIT: u32 = 100;

/// A member whose last heartbeat is younger than this is online.
pub const PRESENCE_WINDOW_SECONDS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: UserProfile,
    pub token: String,
    pub message: String,
}

/// A message row as served by the list and send endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub text: String,
    pub is_anonymous: bool,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub user_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(rename = "tempId", default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: MessagePayload,
    #[serde(rename = "tempId", default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkReadRequest {
    #[serde(rename = "messageIds", default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub online: bool,
}
