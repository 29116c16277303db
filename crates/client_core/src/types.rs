use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryStatus, GroupId, MessageId, UserId},
    protocol::{MessagePayload, UserProfile},
};
use thiserror::Error;

const PROVISIONAL_PREFIX: &str = "temp_";
const ANONYMOUS_NAME: &str = "Anonymous";

/// Client-local identity of an unconfirmed send. Rendered as `temp_<n>` on the
/// wire, which can never parse as a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProvisionalId(pub u64);

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROVISIONAL_PREFIX}{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid provisional id '{0}'")]
pub struct InvalidProvisionalId(pub String);

impl FromStr for ProvisionalId {
    type Err = InvalidProvisionalId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(PROVISIONAL_PREFIX)
            .and_then(|counter| counter.parse::<u64>().ok())
            .map(ProvisionalId)
            .ok_or_else(|| InvalidProvisionalId(s.to_string()))
    }
}

/// Identity of a message in the store. The two namespaces never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Durable(MessageId),
    Provisional(ProvisionalId),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Durable(id) => write!(f, "{id}"),
            MessageKey::Provisional(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl From<&UserProfile> for Author {
    fn from(profile: &UserProfile) -> Self {
        Self {
            user_id: profile.id,
            name: profile.name.clone(),
            avatar_url: Some(profile.avatar_url.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub group_id: GroupId,
    pub author: Author,
    pub text: String,
    pub is_anonymous: bool,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn durable_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Durable(id) => Some(id),
            MessageKey::Provisional(_) => None,
        }
    }

    pub fn provisional_id(&self) -> Option<ProvisionalId> {
        match self.key {
            MessageKey::Provisional(id) => Some(id),
            MessageKey::Durable(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    /// Name to show next to the message; anonymous posts hide the author.
    pub fn display_name(&self) -> &str {
        if self.is_anonymous {
            ANONYMOUS_NAME
        } else {
            &self.author.name
        }
    }
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            key: MessageKey::Durable(payload.id),
            group_id: payload.group_id,
            author: Author {
                user_id: payload.user_id,
                name: payload.user_name,
                avatar_url: payload.avatar_url,
            },
            text: payload.text,
            is_anonymous: payload.is_anonymous,
            status: payload.status,
            created_at: payload.created_at,
        }
    }
}
