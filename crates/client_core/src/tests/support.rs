use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared::{
    domain::{DeliveryStatus, GroupId, MessageId, Role, UserId},
    protocol::{
        LoginResponse, MemberSummary, MessagePayload, SendMessageRequest, SendMessageResponse,
        UserProfile,
    },
};
use tokio::sync::Notify;

use crate::{error::SyncError, transport::ChatApi};

pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub(crate) fn payload(id: i64, user_id: i64, name: &str, text: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        group_id: GroupId(1),
        user_id: UserId(user_id),
        text: text.to_string(),
        is_anonymous: false,
        status: DeliveryStatus::Sent,
        created_at: epoch() + Duration::seconds(id),
        user_name: name.to_string(),
        avatar_url: None,
    }
}

pub(crate) fn member(id: i64, name: &str, last_seen: Option<DateTime<Utc>>) -> MemberSummary {
    MemberSummary {
        id: UserId(id),
        name: name.to_string(),
        avatar_url: None,
        last_seen,
        role: Role::Member,
        joined_at: epoch(),
        online: false,
    }
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub users: Vec<UserProfile>,
    pub messages: Vec<MessagePayload>,
    pub members: Vec<MemberSummary>,
    pub next_message_id: i64,
    pub fail_fetch: Option<SyncError>,
    pub fail_send: Option<SyncError>,
    pub fail_members: Option<SyncError>,
    pub fail_heartbeat: Option<SyncError>,
    pub fetch_calls: Vec<(GroupId, Option<DateTime<Utc>>)>,
    pub mark_read_calls: Vec<Vec<MessageId>>,
    pub member_list_calls: usize,
    pub heartbeats: Vec<UserId>,
    pub cleared_sessions: usize,
}

/// In-memory stand-in for the chat server.
#[derive(Default)]
pub(crate) struct FakeChatApi {
    pub state: StdMutex<FakeState>,
    /// When set, sends are stored immediately but only answered once notified.
    pub send_gate: Option<Arc<Notify>>,
    /// When set, fetches are recorded immediately but only answered once notified.
    pub fetch_gate: Option<Arc<Notify>>,
    pub members_gate: Option<Arc<Notify>>,
}

impl FakeChatApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            send_gate: Some(gate),
            ..Self::default()
        })
    }

    pub(crate) fn fetch_gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            fetch_gate: Some(gate),
            ..Self::default()
        })
    }

    pub(crate) fn members_gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            members_gate: Some(gate),
            ..Self::default()
        })
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.with_state(|state| state.fetch_calls.len())
    }

    pub(crate) fn member_list_count(&self) -> usize {
        self.with_state(|state| state.member_list_calls)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Simulates another client posting to `group_id`.
    pub(crate) fn post_from(
        &self,
        group_id: GroupId,
        user_id: i64,
        name: &str,
        text: &str,
    ) -> MessagePayload {
        self.with_state(|state| store_message(state, group_id, UserId(user_id), name, text, false))
    }
}

fn store_message(
    state: &mut FakeState,
    group_id: GroupId,
    user_id: UserId,
    name: &str,
    text: &str,
    is_anonymous: bool,
) -> MessagePayload {
    state.next_message_id += 1;
    let id = state.next_message_id;
    let message = MessagePayload {
        id: MessageId(id),
        group_id,
        user_id,
        text: text.to_string(),
        is_anonymous,
        status: DeliveryStatus::Sent,
        created_at: epoch() + Duration::seconds(id),
        user_name: name.to_string(),
        avatar_url: None,
    };
    state.messages.push(message.clone());
    message
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn login(&self, name: &str) -> Result<LoginResponse, SyncError> {
        self.with_state(|state| {
            let user = match state.users.iter().find(|user| user.name == name) {
                Some(user) => user.clone(),
                None => {
                    let user = UserProfile {
                        id: UserId(state.users.len() as i64 + 1),
                        name: name.to_string(),
                        avatar_url: format!("https://avatars.test/{name}"),
                        created_at: epoch(),
                    };
                    state.users.push(user.clone());
                    user
                }
            };
            Ok(LoginResponse {
                token: format!("user_{}_0", user.id),
                user,
                message: "Login successful".to_string(),
            })
        })
    }

    async fn fetch_messages(
        &self,
        group_id: GroupId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>, SyncError> {
        self.with_state(|state| state.fetch_calls.push((group_id, since)));
        if let Some(gate) = &self.fetch_gate {
            gate.notified().await;
        }
        self.with_state(|state| {
            if let Some(err) = &state.fail_fetch {
                return Err(err.clone());
            }
            Ok(state
                .messages
                .iter()
                .filter(|message| message.group_id == group_id)
                .filter(|message| since.map_or(true, |since| message.created_at > since))
                .cloned()
                .collect())
        })
    }

    async fn send_message(
        &self,
        group_id: GroupId,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, SyncError> {
        let message = self.with_state(|state| {
            if let Some(err) = &state.fail_send {
                return Err(err.clone());
            }
            let user_id = request.user_id.unwrap_or(UserId(0));
            let name = state
                .users
                .iter()
                .find(|user| user.id == user_id)
                .map(|user| user.name.clone())
                .unwrap_or_default();
            Ok(store_message(
                state,
                group_id,
                user_id,
                &name,
                request.text.trim(),
                request.is_anonymous,
            ))
        })?;
        if let Some(gate) = &self.send_gate {
            gate.notified().await;
        }
        Ok(SendMessageResponse {
            message,
            temp_id: request.temp_id,
        })
    }

    async fn mark_read(&self, _group_id: GroupId, ids: &[MessageId]) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.mark_read_calls.push(ids.to_vec());
            for message in state.messages.iter_mut() {
                if ids.contains(&message.id) {
                    message.status = DeliveryStatus::Read;
                }
            }
        });
        Ok(())
    }

    async fn list_members(&self, _group_id: GroupId) -> Result<Vec<MemberSummary>, SyncError> {
        self.with_state(|state| state.member_list_calls += 1);
        if let Some(gate) = &self.members_gate {
            gate.notified().await;
        }
        self.with_state(|state| match &state.fail_members {
            Some(err) => Err(err.clone()),
            None => Ok(state.members.clone()),
        })
    }

    async fn heartbeat(&self, user_id: UserId) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.heartbeats.push(user_id);
            match &state.fail_heartbeat {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    fn clear_session(&self) {
        self.with_state(|state| state.cleared_sessions += 1);
    }
}
