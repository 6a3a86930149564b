//! Mock CRM backend: REST under `/api` and a Socket.IO endpoint at
//! `/socket.io/`, served by axum on a free local port.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use crm_sync::auth::User;
use crm_sync::store::Store;
use crm_sync::{Config, Manager};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const OPEN: &str = r#"0{"sid":"mock-sid","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

pub struct MockState {
    pub auth_headers: Mutex<Vec<String>>,
    pub emitted: Mutex<Vec<String>>,
    pub failing_seen: Mutex<HashSet<String>>,
    pub pongs: AtomicUsize,
    pub lead_fetches: AtomicUsize,
    pub connections: AtomicUsize,
    pub drop_first_connection: AtomicBool,
    push: broadcast::Sender<String>,
}

pub struct MockBackend {
    pub port: u16,
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            auth_headers: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
            failing_seen: Mutex::new(HashSet::new()),
            pongs: AtomicUsize::new(0),
            lead_fetches: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            drop_first_connection: AtomicBool::new(false),
            push,
        });

        let app = Router::new()
            .route("/socket.io/", get(socket_io))
            .fallback(rest)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { port, state }
    }

    pub fn config(&self) -> Config {
        Config::default()
            .with_api_url(format!("http://127.0.0.1:{}/api", self.port))
            .with_socket_url(format!("http://127.0.0.1:{}", self.port))
            .with_reconnect(Duration::from_millis(50), 3)
            .with_cache_grace(Duration::ZERO)
    }

    /// Send `42[event, payload]` to every connected socket.
    pub fn push(&self, event: &str, payload: Value) {
        let _ = self.state.push.send(format!("42{}", json!([event, payload])));
    }

    pub async fn manager(&self) -> Manager {
        let store = Store::in_memory().await.unwrap();
        Manager::with_store(self.config(), store).unwrap()
    }

    /// A manager with a valid session already stored.
    pub async fn signed_in(&self) -> Manager {
        let manager = self.manager().await;
        manager
            .store()
            .save_session(&jwt(3600, "sig"), &user())
            .await
            .unwrap();
        manager
    }
}

/// An HS256-shaped token whose `exp` is `offset_secs` from now. The server
/// rejects tokens signed `revoked`.
pub fn jwt(offset_secs: i64, signature: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        json!({ "id": "u1", "exp": chrono::Utc::now().timestamp() + offset_secs }).to_string(),
    );
    format!("{header}.{claims}.{signature}")
}

pub fn user_json() -> Value {
    json!({
        "_id": "u1",
        "nameAsPerNID": "Rahim Uddin",
        "email": "rahim@example.com",
        "type": "Operator",
        "status": "active"
    })
}

pub fn user() -> User {
    serde_json::from_value(user_json()).unwrap()
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn rest(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().trim_start_matches("/api");
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

    if segments.as_slice() == ["users", "login"] && method == Method::POST {
        return if body["password"] == "secret" {
            reply(
                StatusCode::OK,
                json!({ "user": user_json(), "token": jwt(3600, "sig") }),
            )
        } else {
            reply(
                StatusCode::UNAUTHORIZED,
                json!({ "msg": "Invalid email or password" }),
            )
        };
    }

    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.auth_headers.lock().push(auth.clone());
    if auth.is_empty() || auth.ends_with(".revoked") {
        return reply(StatusCode::UNAUTHORIZED, json!({ "msg": "Unauthorized" }));
    }

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["whoami"]) => reply(StatusCode::OK, json!({ "authorization": auth })),
        ("POST", ["users", "logout"]) => reply(StatusCode::OK, json!({ "msg": "Logged out" })),
        ("GET", ["users"]) => reply(StatusCode::OK, json!([user_json()])),
        ("GET", ["users", "departments", id]) => reply(
            StatusCode::OK,
            json!({
                "_id": id,
                "departmentName": "Sales",
                "roles": [{"_id": "r1", "roleName": "CRE"}],
                "staffCount": 4
            }),
        ),
        ("GET", ["lead", "conversation"]) => reply(
            StatusCode::OK,
            json!({
                "totalLeads": 2,
                "totalPages": 1,
                "currentPage": 1,
                "leads": [
                    {"_id": "B", "name": "Bilkis", "status": "new", "messagesSeen": false, "lastMessageTime": "2024-05-01T09:00:00Z"},
                    {"_id": "A", "name": "Arif", "status": "new", "messagesSeen": false, "lastMessageTime": "2024-05-01T10:00:00Z"},
                    {"_id": "B", "name": "Bilkis", "status": "new", "messagesSeen": false, "lastMessageTime": "2024-05-01T09:00:00Z"}
                ]
            }),
        ),
        ("GET", ["lead", "conversation", _id, "messages"]) => reply(
            StatusCode::OK,
            json!({
                "messages": [{"messageId": "m1", "content": "hello", "sentByMe": false}],
                "messagesSeen": false
            }),
        ),
        ("PUT", ["lead", "conversation", id, "mark-messages-seen"]) => {
            if state.failing_seen.lock().contains(*id) {
                reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "msg": "Could not update conversation" }),
                )
            } else {
                StatusCode::OK.into_response()
            }
        }
        ("GET", ["lead"]) => reply(
            StatusCode::OK,
            json!({
                "leads": [],
                "total": 0,
                "page": 1,
                "limit": 100,
                "totalPages": 0,
                "query": uri.query().unwrap_or_default()
            }),
        ),
        ("POST", ["lead"]) => {
            if body["phone"].as_str().unwrap_or_default().is_empty() {
                reply(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    json!({ "msg": "Phone number is required" }),
                )
            } else {
                reply(
                    StatusCode::CREATED,
                    json!({
                        "msg": "Lead created successfully",
                        "lead": {"_id": "L9", "name": body["name"], "phone": [body["phone"]]}
                    }),
                )
            }
        }
        ("GET", ["lead", "boom"]) => (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response(),
        ("GET", ["lead", id]) => {
            state.lead_fetches.fetch_add(1, Ordering::SeqCst);
            reply(
                StatusCode::OK,
                json!({"_id": id, "name": "Karim", "status": "new", "comment": []}),
            )
        }
        ("PUT", ["lead", _id]) => reply(StatusCode::OK, json!({ "msg": "Lead updated" })),
        ("POST", ["lead", _id, "reminders"]) => reply(
            StatusCode::CREATED,
            json!({
                "status": "success",
                "reminders": [{"_id": "r1", "time": body["time"], "status": "pending"}]
            }),
        ),
        ("PUT", ["lead", _id, "reminders", reminder_id]) => reply(
            StatusCode::OK,
            json!({ "msg": "Reminder updated", "reminderId": reminder_id, "status": body["status"] }),
        ),
        ("POST", ["lead", _id, "call-logs"]) => {
            reply(StatusCode::CREATED, json!({ "msg": "Call log added" }))
        }
        ("GET", ["lead", _id, "comments"]) => reply(StatusCode::OK, json!({ "comments": [] })),
        ("POST", ["lead", id, "comments"]) => {
            let comment = json!({
                "_id": "C9",
                "comment": body["comment"],
                "images": body["images"],
                "commentBy": {"_id": "u1", "nameAsPerNID": "Rahim Uddin"}
            });
            let _ = state.push.send(format!(
                "42{}",
                json!([format!("newComment_{id}"), {"leadId": id, "comment": comment}])
            ));
            reply(StatusCode::CREATED, json!({ "msg": "Comment added" }))
        }
        _ => reply(StatusCode::NOT_FOUND, json!({ "msg": format!("no route for {path}") })),
    }
}

async fn socket_io(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<MockState>) {
    let n = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut push = state.push.subscribe();
    if socket.send(Message::Text(OPEN.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                match text.as_str() {
                    "40" => {
                        let _ = socket.send(Message::Text(r#"40{"sid":"mock-socket"}"#.to_string())).await;
                        if n == 1 && state.drop_first_connection.load(Ordering::SeqCst) {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                        let _ = socket.send(Message::Text("2".to_string())).await;
                    }
                    "3" => {
                        state.pongs.fetch_add(1, Ordering::SeqCst);
                    }
                    other if other.starts_with("42") => state.emitted.lock().push(other.to_string()),
                    _ => {}
                }
            }
            pushed = push.recv() => match pushed {
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
