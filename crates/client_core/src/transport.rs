use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{GroupId, MessageId, UserId},
    error::ApiError,
    protocol::{
        AckResponse, ListMessagesQuery, LoginRequest, LoginResponse, MarkReadRequest,
        MemberSummary, MessagePayload, SendMessageRequest, SendMessageResponse,
    },
};
use url::Url;

use crate::error::SyncError;

/// The REST surface the sync engine talks to.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn login(&self, name: &str) -> Result<LoginResponse, SyncError>;
    async fn fetch_messages(
        &self,
        group_id: GroupId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>, SyncError>;
    async fn send_message(
        &self,
        group_id: GroupId,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, SyncError>;
    async fn mark_read(&self, group_id: GroupId, ids: &[MessageId]) -> Result<(), SyncError>;
    async fn list_members(&self, group_id: GroupId) -> Result<Vec<MemberSummary>, SyncError>;
    async fn heartbeat(&self, user_id: UserId) -> Result<(), SyncError>;

    /// Drops any credentials kept from the last login.
    fn clear_session(&self) {}
}

pub struct HttpChatApi {
    http: Client,
    api_base: String,
    token: RwLock<Option<String>>,
}

impl HttpChatApi {
    pub fn new(server_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Result<Self> {
        let parsed = Url::parse(server_url.trim())
            .with_context(|| format!("invalid server url '{server_url}'"))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => bail!("unsupported server url scheme '{other}'"),
        }
        let api_base = format!("{}/api", parsed.as_str().trim_end_matches('/'));
        Ok(Self {
            http,
            api_base,
            token: RwLock::new(None),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().ok().and_then(|guard| guard.clone());
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| SyncError::NetworkFailure(err.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| SyncError::NetworkFailure(err.to_string()))?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ApiError>(&body)
            .map(|err| err.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        return Err(SyncError::ServerError {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_slice(&body).map_err(|err| SyncError::MalformedResponse(err.to_string()))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn login(&self, name: &str) -> Result<LoginResponse, SyncError> {
        let request = self
            .http
            .post(format!("{}/auth/login", self.api_base))
            .json(&LoginRequest {
                name: name.to_string(),
            });
        let response: LoginResponse = self.execute(request).await?;
        if let Ok(mut token) = self.token.write() {
            *token = Some(response.token.clone());
        }
        Ok(response)
    }

    async fn fetch_messages(
        &self,
        group_id: GroupId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>, SyncError> {
        let request = self
            .http
            .get(format!("{}/groups/{group_id}/messages", self.api_base))
            .query(&ListMessagesQuery { since });
        self.execute(request).await
    }

    async fn send_message(
        &self,
        group_id: GroupId,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, SyncError> {
        let request = self
            .http
            .post(format!("{}/groups/{group_id}/messages", self.api_base))
            .json(&request);
        self.execute(request).await
    }

    async fn mark_read(&self, group_id: GroupId, ids: &[MessageId]) -> Result<(), SyncError> {
        let request = self
            .http
            .post(format!("{}/groups/{group_id}/read", self.api_base))
            .json(&MarkReadRequest {
                message_ids: ids.to_vec(),
            });
        let _: AckResponse = self.execute(request).await?;
        Ok(())
    }

    async fn list_members(&self, group_id: GroupId) -> Result<Vec<MemberSummary>, SyncError> {
        let request = self
            .http
            .get(format!("{}/groups/{group_id}/members", self.api_base));
        self.execute(request).await
    }

    async fn heartbeat(&self, user_id: UserId) -> Result<(), SyncError> {
        let request = self
            .http
            .post(format!("{}/auth/user/{user_id}/online", self.api_base));
        let _: AckResponse = self.execute(request).await?;
        Ok(())
    }

    fn clear_session(&self) {
        if let Ok(mut token) = self.token.write() {
            *token = None;
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
