use crate::auth;
use crate::bus::{Event, EventBus, NotificationLevel};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// HTTP client for the CRM backend.
///
/// The bearer token is read from the store on every request, so a login or
/// logout elsewhere takes effect on the next call.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    store: Store,
    bus: Arc<EventBus>,
}

impl RestClient {
    pub fn new(config: &Config, store: Store, bus: Arc<EventBus>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            store,
            bus,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// End the session from the client side and tell everyone listening.
    pub async fn force_logout(&self, reason: &str) -> SyncError {
        warn!("Forcing logout: {}", reason);
        if let Err(e) = self.store.clear_session().await {
            error!("Failed to clear stored session: {}", e);
        }
        self.bus.publish(Event::ForcedLogout {
            reason: reason.to_string(),
        });
        SyncError::Auth(reason.to_string())
    }

    async fn bearer(&self) -> SyncResult<String> {
        let Some(token) = self.store.token().await? else {
            return Err(self.force_logout("no session token").await);
        };
        // Tokens we can't decode are left for the server to judge.
        if auth::token_is_expired(&token) {
            return Err(self.force_logout("session token expired").await);
        }
        Ok(token)
    }

    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> SyncResult<T> {
        let token = self.bearer().await?;
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.execute(&method, path, request, true).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        self.send(Method::GET, path, None).await
    }

    pub async fn get_query<T, Q>(&self, path: &str, query: &Q) -> SyncResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let token = self.bearer().await?;
        let request = self
            .http
            .get(self.url(path))
            .query(query)
            .bearer_auth(token);
        self.execute(&Method::GET, path, request, true).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> SyncResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::POST, path, Some(serde_json::to_value(body)?))
            .await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> SyncResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::PUT, path, Some(serde_json::to_value(body)?))
            .await
    }

    /// POST without a bearer token (login). A 401 here is a bad credential,
    /// not a dead session.
    pub async fn post_public<T, B>(&self, path: &str, body: &B) -> SyncResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self.http.post(self.url(path)).json(body);
        self.execute(&Method::POST, path, request, false).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        request: RequestBuilder,
        authenticated: bool,
    ) -> SyncResult<T> {
        debug!("{} {}", method, path);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.network_failure(method, path, e)),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Err(self.network_failure(method, path, e)),
        };
        debug!("{} {} -> {}", method, path, status);

        if status == StatusCode::UNAUTHORIZED {
            if authenticated {
                return Err(self.force_logout("session rejected by server").await);
            }
            return Err(SyncError::Auth(error_message(&body, status)));
        }
        if status.is_client_error() {
            return Err(SyncError::Validation {
                status: status.as_u16(),
                message: error_message(&body, status),
            });
        }
        if status.is_server_error() {
            warn!("{} {} failed with {}", method, path, status);
            return Err(SyncError::Server {
                status: status.as_u16(),
                message: error_message(&body, status),
            });
        }

        decode_body(&body)
    }

    fn network_failure(&self, method: &Method, path: &str, err: reqwest::Error) -> SyncError {
        let err = SyncError::from(err);
        warn!("{} {} failed: {}", method, path, err);
        if err.is_transient() {
            self.bus
                .notify(NotificationLevel::Warning, format!("Network error: {err}"));
        }
        err
    }
}

/// The server's own explanation if it sent one, else the raw body or the
/// status reason.
fn error_message(body: &str, status: StatusCode) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["msg", "message", "error"]
            .iter()
            .find_map(|k| v.get(k).and_then(Value::as_str).map(str::to_string))
    });
    if let Some(message) = from_json {
        return message;
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}

/// An empty body decodes as JSON `null`, so `()` and `Option<T>` responses work.
fn decode_body<T: DeserializeOwned>(body: &str) -> SyncResult<T> {
    if body.trim().is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{test_token, User};
    use chrono::{Duration as ChronoDuration, Utc};

    #[test]
    fn error_message_prefers_server_msg() {
        let status = StatusCode::UNPROCESSABLE_ENTITY;
        assert_eq!(
            error_message(r#"{"msg":"Phone number already exists"}"#, status),
            "Phone number already exists"
        );
        assert_eq!(
            error_message(r#"{"message":"Invalid lead id"}"#, status),
            "Invalid lead id"
        );
        assert_eq!(error_message("plain failure", status), "plain failure");
        assert_eq!(error_message("", StatusCode::NOT_FOUND), "Not Found");
    }

    #[test]
    fn empty_body_decodes_as_null() {
        decode_body::<()>("").unwrap();
        let value: Option<u32> = decode_body("  ").unwrap();
        assert_eq!(value, None);
        assert!(matches!(
            decode_body::<u32>("{oops"),
            Err(SyncError::Decode(_))
        ));
    }

    async fn client() -> (RestClient, Store, Arc<EventBus>) {
        let store = Store::in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let config = Config::default().with_api_url("http://127.0.0.1:9/api/");
        let rest = RestClient::new(&config, store.clone(), bus.clone()).unwrap();
        (rest, store, bus)
    }

    #[tokio::test]
    async fn trailing_slash_is_trimmed() {
        let (rest, _, _) = client().await;
        assert_eq!(rest.url("/lead/L1"), "http://127.0.0.1:9/api/lead/L1");
    }

    #[tokio::test]
    async fn missing_token_forces_logout_without_a_request() {
        let (rest, _, bus) = client().await;
        let mut events = bus.subscribe();

        let err = rest.get::<Value>("/lead/L1").await.unwrap_err();
        assert!(err.is_auth());
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::ForcedLogout { .. }
        ));
    }

    #[tokio::test]
    async fn expired_token_clears_the_session() {
        let (rest, store, bus) = client().await;
        let mut events = bus.subscribe();
        let token = test_token(Utc::now() - ChronoDuration::hours(1));
        store.save_session(&token, &User::test_user("u1")).await.unwrap();

        let err = rest.get::<Value>("/lead/L1").await.unwrap_err();
        assert!(err.is_auth());
        assert!(store.token().await.unwrap().is_none());
        assert!(store.user().await.unwrap().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            Event::ForcedLogout {
                reason: "session token expired".into()
            }
        );
    }
}
