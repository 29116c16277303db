use super::*;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::DeliveryStatus,
    error::ErrorCode,
    protocol::{AckResponse, UserProfile},
};
use tokio::{net::TcpListener, sync::Mutex};

use crate::test_support::{epoch, member, payload};

#[derive(Clone, Default)]
struct Recorded {
    since: Arc<Mutex<Vec<Option<DateTime<Utc>>>>>,
    auth_headers: Arc<Mutex<Vec<Option<String>>>>,
    read_ids: Arc<Mutex<Vec<Vec<MessageId>>>>,
}

async fn spawn_server(recorded: Recorded) -> String {
    async fn login(Json(req): Json<LoginRequest>) -> Json<LoginResponse> {
        Json(LoginResponse {
            user: UserProfile {
                id: UserId(7),
                name: req.name,
                avatar_url: "https://avatars.test/alice".into(),
                created_at: epoch(),
            },
            token: "user_7_1".into(),
            message: "Login successful".into(),
        })
    }

    async fn messages(
        State(recorded): State<Recorded>,
        headers: HeaderMap,
        Query(query): Query<ListMessagesQuery>,
    ) -> Json<Vec<MessagePayload>> {
        recorded.since.lock().await.push(query.since);
        recorded.auth_headers.lock().await.push(
            headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        );
        Json(vec![payload(1, 2, "bob", "x"), payload(2, 2, "bob", "y")])
    }

    async fn send(
        Path(group_id): Path<i64>,
        Json(req): Json<SendMessageRequest>,
    ) -> Json<SendMessageResponse> {
        let mut message = payload(3, 7, "alice", &req.text);
        message.group_id = GroupId(group_id);
        Json(SendMessageResponse {
            message,
            temp_id: req.temp_id,
        })
    }

    async fn read(
        State(recorded): State<Recorded>,
        Json(req): Json<MarkReadRequest>,
    ) -> Json<AckResponse> {
        recorded.read_ids.lock().await.push(req.message_ids);
        Json(AckResponse { ok: true })
    }

    async fn members(
        Path(group_id): Path<i64>,
    ) -> Result<Json<Vec<MemberSummary>>, (StatusCode, Json<ApiError>)> {
        if group_id != 1 {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "group not found")),
            ));
        }
        Ok(Json(vec![member(2, "bob", Some(epoch()))]))
    }

    async fn heartbeat(Path(user_id): Path<i64>) -> (StatusCode, &'static str) {
        if user_id == 99 {
            (StatusCode::OK, "not json")
        } else {
            (StatusCode::OK, r#"{"ok":true}"#)
        }
    }

    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/user/:user_id/online", post(heartbeat))
        .route("/api/groups/:group_id/messages", get(messages).post(send))
        .route("/api/groups/:group_id/read", post(read))
        .route("/api/groups/:group_id/members", get(members))
        .with_state(recorded);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[test]
fn rejects_non_http_server_urls() {
    assert!(HttpChatApi::new("ws://localhost:3000").is_err());
    assert!(HttpChatApi::new("not a url").is_err());

    let api = HttpChatApi::new("http://localhost:3000/").expect("api");
    assert_eq!(api.api_base(), "http://localhost:3000/api");
}

#[tokio::test]
async fn login_token_is_sent_on_later_requests() {
    let recorded = Recorded::default();
    let base = spawn_server(recorded.clone()).await;
    let api = HttpChatApi::new(&base).expect("api");

    api.fetch_messages(GroupId(1), None).await.expect("fetch");
    let login = api.login("alice").await.expect("login");
    assert_eq!(login.user.id, UserId(7));
    api.fetch_messages(GroupId(1), None).await.expect("fetch");
    api.clear_session();
    api.fetch_messages(GroupId(1), None).await.expect("fetch");

    assert_eq!(
        *recorded.auth_headers.lock().await,
        vec![None, Some("Bearer user_7_1".to_string()), None]
    );
}

#[tokio::test]
async fn fetch_passes_since_cursor_and_decodes_messages() {
    let recorded = Recorded::default();
    let base = spawn_server(recorded.clone()).await;
    let api = HttpChatApi::new(&base).expect("api");
    let since = epoch() + chrono::Duration::milliseconds(1_250);

    let messages = api
        .fetch_messages(GroupId(1), Some(since))
        .await
        .expect("fetch");

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, "y");
    assert_eq!(*recorded.since.lock().await, vec![Some(since)]);
}

#[tokio::test]
async fn send_echoes_temp_id_and_mark_read_posts_ids() {
    let recorded = Recorded::default();
    let base = spawn_server(recorded.clone()).await;
    let api = HttpChatApi::new(&base).expect("api");

    let response = api
        .send_message(
            GroupId(1),
            SendMessageRequest {
                text: "hi".into(),
                is_anonymous: false,
                user_id: Some(UserId(7)),
                temp_id: Some("temp_1".into()),
            },
        )
        .await
        .expect("send");
    assert_eq!(response.temp_id.as_deref(), Some("temp_1"));
    assert_eq!(response.message.status, DeliveryStatus::Sent);

    api.mark_read(GroupId(1), &[MessageId(1), MessageId(2)])
        .await
        .expect("mark read");
    assert_eq!(
        *recorded.read_ids.lock().await,
        vec![vec![MessageId(1), MessageId(2)]]
    );
}

#[tokio::test]
async fn error_bodies_become_server_errors() {
    let base = spawn_server(Recorded::default()).await;
    let api = HttpChatApi::new(&base).expect("api");

    assert_eq!(api.list_members(GroupId(1)).await.expect("members").len(), 1);
    let err = api.list_members(GroupId(5)).await.expect_err("missing group");
    assert_eq!(
        err,
        SyncError::ServerError {
            status: 404,
            message: "group not found".into(),
        }
    );
    assert!(!err.is_transient());
}

#[tokio::test]
async fn undecodable_body_is_malformed() {
    let base = spawn_server(Recorded::default()).await;
    let api = HttpChatApi::new(&base).expect("api");

    api.heartbeat(UserId(7)).await.expect("heartbeat");
    let err = api.heartbeat(UserId(99)).await.expect_err("bad body");
    assert!(matches!(err, SyncError::MalformedResponse(_)));
}

#[tokio::test]
async fn unreachable_server_is_a_network_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let api = HttpChatApi::new(&format!("http://{addr}")).expect("api");

    let err = api.heartbeat(UserId(1)).await.expect_err("refused");
    assert!(matches!(err, SyncError::NetworkFailure(_)));
    assert!(err.is_transient());
}
