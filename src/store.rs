use crate::{auth::User, error::SyncResult};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use tracing::{debug, warn};

pub const TOKEN_KEY: &str = "token";
pub const USER_KEY: &str = "user";

/// Key-value store holding the persisted session.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the store at `db_path`, creating the file and its parent directory
    /// if they don't exist.
    pub async fn open(db_path: impl AsRef<Path>) -> SyncResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options).await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// In-memory store. A single pinned connection keeps the database alive.
    pub async fn in_memory() -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, key: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The bearer token, read fresh on every call.
    pub async fn token(&self) -> SyncResult<Option<String>> {
        self.get(TOKEN_KEY).await
    }

    /// The stored user profile. A profile that fails to parse is treated as absent.
    pub async fn user(&self) -> SyncResult<Option<User>> {
        let Some(raw) = self.get(USER_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                warn!("Stored user profile is unreadable: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn save_session(&self, token: &str, user: &User) -> SyncResult<()> {
        let profile = serde_json::to_string(user)?;
        self.set(TOKEN_KEY, token).await?;
        self.set(USER_KEY, &profile).await?;
        debug!("Session stored for user {}", user.id);
        Ok(())
    }

    pub async fn clear_session(&self) -> SyncResult<()> {
        self.remove(TOKEN_KEY).await?;
        self.remove(USER_KEY).await?;
        debug!("Session cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_overwrites_and_remove_deletes() {
        let store = Store::in_memory().await.unwrap();
        assert_eq!(store.get("token").await.unwrap(), None);

        store.set("token", "first").await.unwrap();
        store.set("token", "second").await.unwrap();
        assert_eq!(store.token().await.unwrap().as_deref(), Some("second"));

        store.remove("token").await.unwrap();
        assert_eq!(store.token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn session_round_trip_and_clear() {
        let store = Store::in_memory().await.unwrap();
        let user = User::test_user("u1");

        store.save_session("jwt", &user).await.unwrap();
        assert_eq!(store.token().await.unwrap().as_deref(), Some("jwt"));
        assert_eq!(store.user().await.unwrap().map(|u| u.id), Some("u1".to_string()));

        store.clear_session().await.unwrap();
        assert!(store.token().await.unwrap().is_none());
        assert!(store.user().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_profile_is_absent() {
        let store = Store::in_memory().await.unwrap();
        store.set(USER_KEY, "{not json").await.unwrap();
        assert!(store.user().await.unwrap().is_none());
    }
}
