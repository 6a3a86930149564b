use crate::error::SyncResult;
use crate::store::Store;
use crate::transport::rest::RestClient;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "nameAsPerNID", default)]
    pub name_as_per_nid: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub personal_phone: Option<String>,
    #[serde(default)]
    pub office_phone: Option<String>,
    /// `Admin` or `Operator`
    #[serde(rename = "type", default)]
    pub user_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub role_id: Option<Value>,
    #[serde(default)]
    pub department_id: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub role_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub department_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub staff_count: u64,
}

/// `GET /users/{id}`: the profile with role and department populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDetail {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "nameAsPerNID", default)]
    pub name_as_per_nid: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub department: Option<Department>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub token: String,
}

#[derive(Deserialize)]
struct Claims {
    exp: f64,
}

/// Expiry of a JWT, or `None` if the token can't be decoded.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp as i64, 0)
}

/// True only for a decodable token whose `exp` is still ahead.
pub fn token_is_valid(token: &str) -> bool {
    token_expiry(token).is_some_and(|exp| exp > Utc::now())
}

/// True only for a decodable token whose `exp` has passed.
pub fn token_is_expired(token: &str) -> bool {
    token_expiry(token).is_some_and(|exp| exp <= Utc::now())
}

/// Login state backed by the persisted token and profile.
#[derive(Clone)]
pub struct Session {
    rest: RestClient,
    store: Store,
}

impl Session {
    pub fn new(rest: RestClient, store: Store) -> Self {
        Self { rest, store }
    }

    pub async fn login(&self, email: &str, password: &str) -> SyncResult<User> {
        let response: LoginResponse = self
            .rest
            .post_public("/users/login", &json!({ "email": email, "password": password }))
            .await?;
        self.store
            .save_session(&response.token, &response.user)
            .await?;
        info!("Logged in as {}", response.user.email);
        Ok(response.user)
    }

    /// Tell the server, then forget the session locally whatever it answers.
    pub async fn logout(&self) -> SyncResult<()> {
        let token = self.store.token().await?;
        if token.as_deref().is_some_and(|t| !token_is_expired(t)) {
            if let Err(e) = self
                .rest
                .send::<Value>(Method::POST, "/users/logout", None)
                .await
            {
                warn!("Server logout failed: {}", e);
            }
        }
        self.store.clear_session().await?;
        info!("Logged out");
        Ok(())
    }

    /// Resume a persisted session. Anything short of an unexpired token plus a
    /// readable profile clears both.
    pub async fn restore(&self) -> SyncResult<Option<User>> {
        let token = self.store.token().await?;
        let user = self.store.user().await?;

        match (token, user) {
            (Some(token), Some(user)) if token_is_valid(&token) => {
                info!("Restored session for {}", user.email);
                Ok(Some(user))
            }
            _ => {
                debug!("No usable stored session");
                self.store.clear_session().await?;
                Ok(None)
            }
        }
    }

    pub async fn current_user(&self) -> SyncResult<Option<User>> {
        self.store.user().await
    }

    pub async fn is_logged_in(&self) -> SyncResult<bool> {
        Ok(self
            .store
            .token()
            .await?
            .is_some_and(|t| token_is_valid(&t)))
    }
}

#[cfg(test)]
impl User {
    pub(crate) fn test_user(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name_as_per_nid: "Test User".to_string(),
            nickname: None,
            email: format!("{id}@example.com"),
            personal_phone: None,
            office_phone: None,
            user_type: "Operator".to_string(),
            status: "active".to_string(),
            role_id: None,
            department_id: None,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_token(exp: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(json!({ "id": "u1", "exp": exp.timestamp() }).to_string());
    format!("{header}.{claims}.signature")
}
