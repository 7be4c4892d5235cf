use async_trait::async_trait;
use sqlx::SqlitePool;

use shared_types::ConversationState;

use super::{strip_ancillary, StateStore, StoreError};

/// SQLite-backed state store.
///
/// Schema (created on [`SqliteStateStore::migrate`]):
/// ```sql
/// CREATE TABLE IF NOT EXISTS conversation_states (
///     id         TEXT    PRIMARY KEY,
///     document   TEXT    NOT NULL,   -- ConversationState as JSON
///     updated_at INTEGER NOT NULL    -- Unix timestamp (seconds)
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the conversation_states table if it does not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_states (
                id         TEXT    PRIMARY KEY,
                document   TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, id: &str) -> Result<ConversationState, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM conversation_states WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            None => Err(StoreError::NotFound(id.to_string())),
            Some((document,)) => {
                serde_json::from_str(&document).map_err(|e| StoreError::Decode(e.to_string()))
            }
        }
    }

    async fn put(&self, state: &ConversationState) -> Result<(), StoreError> {
        let stripped = strip_ancillary(state);
        let document =
            serde_json::to_string(&stripped).map_err(|e| StoreError::Encode(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO conversation_states (id, document, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET document = excluded.document, updated_at = excluded.updated_at",
        )
        .bind(&state.id)
        .bind(&document)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }
}

/// Open (and create if missing) the engine's SQLite database.
///
/// Handles both "sqlite:./foo.db" and plain path forms; the parent
/// directory is created if it does not exist.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    let abs_path = std::env::current_dir()?.join(file_path);
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = sqlx::SqlitePool::connect_with(
        sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&abs_path)
            .create_if_missing(true),
    )
    .await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::UploadedFile;

    async fn test_store() -> (SqliteStateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("engine-test.db");
        let pool = connect(db_path.to_str().unwrap()).await.unwrap();
        let store = SqliteStateStore::new(pool);
        store.migrate().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (store, _dir) = test_store().await;

        let mut state = ConversationState::new("conv_rt", "round trip");
        state.current_level = 3;
        state.key_insights.push("insight one".to_string());
        store.put(&state).await.unwrap();

        let loaded = store.get("conv_rt").await.unwrap();
        assert_eq!(loaded.id, "conv_rt");
        assert_eq!(loaded.current_level, 3);
        assert_eq!(loaded.key_insights, vec!["insight one".to_string()]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (store, _dir) = test_store().await;
        match store.get("absent").await {
            Err(StoreError::NotFound(id)) => assert_eq!(id, "absent"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_strips_upload_text() {
        let (store, _dir) = test_store().await;

        let mut state = ConversationState::new("conv_strip", "strip payloads");
        state.uploaded_files.push(UploadedFile {
            id: "file_1".to_string(),
            name: "data.csv".to_string(),
            path: "/uploads/data.csv".to_string(),
            text: Some("a,b\n1,2".to_string()),
        });
        store.put(&state).await.unwrap();

        let loaded = store.get("conv_strip").await.unwrap();
        assert!(loaded.uploaded_files[0].text.is_none());
        assert_eq!(loaded.uploaded_files[0].path, "/uploads/data.csv");
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let (store, _dir) = test_store().await;

        let mut state = ConversationState::new("conv_up", "first");
        store.put(&state).await.unwrap();
        state.current_level = 5;
        store.put(&state).await.unwrap();

        let loaded = store.get("conv_up").await.unwrap();
        assert_eq!(loaded.current_level, 5);
    }
}
