use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::{
    domain::{GroupId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AckResponse, ListMessagesQuery, LoginRequest, LoginResponse, MarkReadRequest,
        MemberSummary, MessagePayload, SendMessageRequest, SendMessageResponse,
    },
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::error;

use crate::app_state::AppState;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/auth/login", post(http_login))
        .route("/auth/user/:user_id/online", post(http_heartbeat))
        .route("/groups/:group_id/members", get(http_list_members))
        .route(
            "/groups/:group_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route("/groups/:group_id/read", post(http_mark_read));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|err| {
        error!(%err, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let response = server_api::login(&state.api, &req.name, Utc::now())
        .await
        .map_err(into_http)?;
    Ok(Json(response))
}

async fn http_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<AckResponse> {
    let ack = server_api::heartbeat(&state.api, UserId(user_id), Utc::now())
        .await
        .map_err(into_http)?;
    Ok(Json(ack))
}

async fn http_list_members(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
) -> ApiResult<Vec<MemberSummary>> {
    let members = server_api::list_members(&state.api, GroupId(group_id), Utc::now())
        .await
        .map_err(into_http)?;
    Ok(Json(members))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> ApiResult<Vec<MessagePayload>> {
    let messages = server_api::list_messages(&state.api, GroupId(group_id), q.since)
        .await
        .map_err(into_http)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    let response = server_api::send_message(&state.api, GroupId(group_id), req, Utc::now())
        .await
        .map_err(into_http)?;
    Ok(Json(response))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<AckResponse> {
    let ack = server_api::mark_read(&state.api, GroupId(group_id), req)
        .await
        .map_err(into_http)?;
    Ok(Json(ack))
}

fn into_http(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => {
            error!(message = %err.message, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
