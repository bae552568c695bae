// End-to-end over a real socket: an axum server stands in for the marketplace backend.
mod common;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{customer, setup_logging};
use marketlink::{
    ConnectionState, Connector, Error, HttpApi, Id, MessageKind, NotificationPreferences, RestApi,
    SendOutcome, Session, Settings, WsConnector,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const TOKEN: &str = "secret";

#[derive(Clone, Default)]
struct Backend {
    log: Arc<Mutex<Vec<String>>>,
    prefs: Arc<Mutex<Option<Value>>>,
}

impl Backend {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn entries(&self, prefix: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
    let expected = format!("Bearer {}", TOKEN);
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn socket(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(backend): State<Backend>,
) -> Response {
    let user = query.get("userId").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_socket(socket, user, backend))
}

async fn serve_socket(mut socket: WebSocket, user: String, backend: Backend) {
    backend.record(format!("ws:{}", user));
    let snapshot = json!({"type": "online_users_list", "data": [{"userId": 9}]});
    if socket.send(Message::Text(snapshot.to_string())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let frame_type = frame["type"].as_str().unwrap_or_default().to_string();
        backend.record(format!("frame:{}", frame_type));

        if frame_type == "chat_message" {
            let data = &frame["data"];
            let echo = json!({
                "type": "chat_message",
                "data": {
                    "id": 500,
                    "chatId": data["chatId"],
                    "senderId": data["senderId"],
                    "content": data["content"],
                    "messageType": data["messageType"],
                }
            });
            if socket.send(Message::Text(echo.to_string())).await.is_err() {
                break;
            }
        }
    }
}

async fn chats(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!({
        "data": [{
            "id": 42,
            "customerId": 1,
            "providerId": 2,
            "providerName": "Pat",
            "unreadCount": 0
        }]
    })))
}

async fn history(headers: HeaderMap, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!([
        {"id": 1, "chatId": id, "senderId": 2, "content": "hello", "createdAt": "2026-01-05T10:00:00Z"}
    ])))
}

async fn pending(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(backend): State<Backend>,
) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    backend.record(format!(
        "pending:{}",
        query.get("limit").cloned().unwrap_or_default()
    ));
    Ok(Json(json!([
        {"id": 7, "type": "new_message", "status": "pending", "message": "hello", "chatId": 42}
    ])))
}

async fn delivered(
    headers: HeaderMap,
    Path(id): Path<String>,
    State(backend): State<Backend>,
    Json(body): Json<Value>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    backend.record(format!(
        "delivered:{}:{}",
        id,
        body["channel"].as_str().unwrap_or_default()
    ));
    Ok(StatusCode::NO_CONTENT)
}

async fn seen(
    headers: HeaderMap,
    Path(id): Path<String>,
    State(backend): State<Backend>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    backend.record(format!("seen:{}", id));
    Ok(StatusCode::NO_CONTENT)
}

async fn chat_seen(
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    State(backend): State<Backend>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    backend.record(format!("chat_seen:{}", chat_id));
    Ok(StatusCode::NO_CONTENT)
}

async fn get_preferences(
    headers: HeaderMap,
    State(backend): State<Backend>,
) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    let stored = backend.prefs.lock().unwrap().clone();
    Ok(Json(stored.unwrap_or_else(|| json!({}))))
}

async fn put_preferences(
    headers: HeaderMap,
    State(backend): State<Backend>,
    Json(body): Json<Value>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    *backend.prefs.lock().unwrap() = Some(body);
    Ok(StatusCode::NO_CONTENT)
}

async fn spawn_backend() -> (SocketAddr, Backend) {
    setup_logging();
    let backend = Backend::default();
    let app = Router::new()
        .route("/ws", get(socket))
        .route("/api/chats", get(chats))
        .route("/api/chats/:id/messages", get(history))
        .route("/api/notifications/pending", get(pending))
        .route("/api/notifications/preferences", get(get_preferences).put(put_preferences))
        .route("/api/notifications/chat/:chat_id/seen", post(chat_seen))
        .route("/api/notifications/:id/delivered", post(delivered))
        .route("/api/notifications/:id/seen", post(seen))
        .with_state(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, backend)
}

fn settings_for(addr: SocketAddr, token: Option<&str>) -> Settings {
    let mut settings = Settings::new(&format!("http://{}", addr)).unwrap();
    settings.token = token.map(str::to_string);
    settings
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn session_runs_against_live_backend() {
    let (addr, backend) = spawn_backend().await;
    let settings = settings_for(addr, Some(TOKEN));
    let api = Arc::new(HttpApi::new(&settings).unwrap());
    let session = Session::new(settings, customer("1"), api, Arc::new(WsConnector));

    assert_eq!(session.start().await.unwrap(), ConnectionState::Open);
    let sockets = backend.clone();
    assert!(eventually(|| sockets.entries("ws:") == vec!["ws:1"]).await);
    assert_eq!(backend.entries("pending:"), vec!["pending:50"]);
    assert_eq!(backend.entries("delivered:"), vec!["delivered:7:pull"]);

    let rooms = session.chats().rooms();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].provider.name.as_deref(), Some("Pat"));
    assert_eq!(session.notifications().list()[0].id, Id::from("7"));

    let presence = session.presence().clone();
    assert!(eventually(|| presence.is_user_online(&Id::from("9"))).await);

    let history = session
        .chats()
        .set_active_chat(Some(Id::from("42")))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let outcome = session
        .chats()
        .send_message(&Id::from("42"), "see you at noon", MessageKind::Text);
    assert_eq!(outcome, SendOutcome::Pushed);
    let chats = session.chats().clone();
    assert!(eventually(|| chats.messages(&Id::from("42")).len() == 2).await);
    assert_eq!(chats.messages(&Id::from("42"))[1].content, "see you at noon");
    assert_eq!(chats.room(&Id::from("42")).unwrap().unread, 0);

    session.notifications().mark_chat_seen(&Id::from("42")).await.unwrap();
    assert_eq!(backend.entries("chat_seen:"), vec!["chat_seen:42"]);

    session.shutdown();
    assert_eq!(session.connection().state(), ConnectionState::Closed);
}

#[tokio::test]
async fn rest_client_sends_bearer_credential() {
    let (addr, _backend) = spawn_backend().await;

    let anonymous = HttpApi::new(&settings_for(addr, None)).unwrap();
    match anonymous.list_chats().await {
        Err(Error::Status { status, .. }) => assert_eq!(status, 401),
        other => panic!("expected 401, got {:?}", other.map(|c| c.len())),
    }

    let api = HttpApi::new(&settings_for(addr, Some(TOKEN))).unwrap();
    let chats = api.list_chats().await.unwrap();
    assert_eq!(chats[0].id, Id::from("42"));
}

#[tokio::test]
async fn preferences_round_trip_over_http() {
    let (addr, backend) = spawn_backend().await;
    let api = HttpApi::new(&settings_for(addr, Some(TOKEN))).unwrap();

    assert_eq!(api.preferences().await.unwrap(), NotificationPreferences::default());

    let prefs = NotificationPreferences {
        jobs: false,
        native_alerts: false,
        ..NotificationPreferences::default()
    };
    api.save_preferences(&prefs).await.unwrap();
    assert_eq!(
        backend.prefs.lock().unwrap().clone().unwrap()["nativeAlerts"],
        false
    );
    assert_eq!(api.preferences().await.unwrap(), prefs);

    api.ack_seen(&Id::from("7")).await.unwrap();
    assert_eq!(backend.entries("seen:"), vec!["seen:7"]);
}

#[tokio::test]
async fn ws_connector_reports_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("ws://{}/ws?userId=1", addr).parse().unwrap();
    let result = WsConnector.open(&url).await;
    assert!(matches!(result, Err(Error::Connection(_))));
}
