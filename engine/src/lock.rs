//! Distributed start lock.
//!
//! The lock serializes only the *decision* to start a run - it is never
//! held for the run's duration (lease renewal in the ledger covers that).
//! If the lock service is unreachable or unconfigured the lock degrades to
//! fallback mode instead of failing the caller: run admission then relies
//! on best-effort deduplication through the run ledger alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock service backend error: {0}")]
    Backend(String),
}

/// Minimal distributed-lock contract: atomic conditional-set-with-expiry
/// plus atomic compare-and-delete.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Set `key -> token` if the key is absent or its holder's TTL has
    /// expired. Returns true iff this caller now holds the lock.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete the key only if it still maps to `token`, so a lock can never
    /// be released by a party that does not hold it. Returns true iff the
    /// key was deleted.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

/// A held start lock; pass back to [`StartLock::release`].
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

/// Result of a start-lock acquisition attempt.
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockHandle),
    /// Another caller holds the lock.
    Busy,
    /// No lock service available; caller must dedupe via the ledger alone.
    Fallback,
}

/// Bounded-retry wrapper around a [`LockService`].
#[derive(Clone)]
pub struct StartLock {
    service: Option<Arc<dyn LockService>>,
    ttl: Duration,
    attempts: u32,
    backoff: Duration,
}

impl StartLock {
    pub fn new(
        service: Option<Arc<dyn LockService>>,
        ttl: Duration,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            service,
            ttl,
            attempts: attempts.max(1),
            backoff,
        }
    }

    fn lock_key(conversation_state_id: &str) -> String {
        format!("research-start:{conversation_state_id}")
    }

    /// Try to acquire the start lock for a conversation, retrying with
    /// linear backoff. A lock-service error degrades to fallback mode
    /// rather than failing the start attempt.
    pub async fn acquire(&self, conversation_state_id: &str) -> LockAcquisition {
        let Some(service) = &self.service else {
            return LockAcquisition::Fallback;
        };

        let key = Self::lock_key(conversation_state_id);
        let token = uuid::Uuid::new_v4().to_string();

        for attempt in 1..=self.attempts {
            match service.try_acquire(&key, &token, self.ttl).await {
                Ok(true) => {
                    tracing::debug!(key = %key, attempt, "Start lock acquired");
                    return LockAcquisition::Acquired(LockHandle { key, token });
                }
                Ok(false) => {
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Start lock service unavailable; degrading to ledger-only dedup"
                    );
                    return LockAcquisition::Fallback;
                }
            }
        }

        LockAcquisition::Busy
    }

    /// Release a held lock. Best-effort: the TTL bounds the damage of a
    /// lost release.
    pub async fn release(&self, handle: LockHandle) {
        if let Some(service) = &self.service {
            match service.release(&handle.key, &handle.token).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(key = %handle.key, "Start lock already expired or taken over");
                }
                Err(e) => {
                    tracing::warn!(key = %handle.key, error = %e, "Start lock release failed");
                }
            }
        }
    }
}

// ============================================================================
// SQLite lock service
// ============================================================================

/// SQLite-backed lock service.
///
/// Schema (created on [`SqliteLockService::migrate`]):
/// ```sql
/// CREATE TABLE IF NOT EXISTS start_locks (
///     key        TEXT    PRIMARY KEY,
///     token      TEXT    NOT NULL,
///     expires_at INTEGER NOT NULL   -- Unix timestamp (milliseconds)
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SqliteLockService {
    pool: SqlitePool,
}

impl SqliteLockService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS start_locks (
                key        TEXT    PRIMARY KEY,
                token      TEXT    NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        // Fast path: the key is absent.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO start_locks (key, token, expires_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?
        .rows_affected();

        if inserted > 0 {
            return Ok(true);
        }

        // Slow path: displace an expired holder atomically.
        let displaced = sqlx::query(
            "UPDATE start_locks SET token = ?, expires_at = ? WHERE key = ? AND expires_at <= ?",
        )
        .bind(token)
        .bind(expires_at)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?
        .rows_affected();

        Ok(displaced > 0)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let deleted = sqlx::query("DELETE FROM start_locks WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?
            .rows_affected();
        Ok(deleted > 0)
    }
}

// ============================================================================
// In-memory lock service
// ============================================================================

/// In-memory lock service for tests and single-process runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockService {
    locks: Arc<Mutex<HashMap<String, (String, chrono::DateTime<chrono::Utc>)>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = chrono::Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| LockError::Backend(e.to_string()))?;

        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some((_, held_until)) if *held_until > now => Ok(false),
            _ => {
                locks.insert(key.to_string(), (token.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some((held_token, _)) if held_token == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
