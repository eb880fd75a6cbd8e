/// Refresh Ledger
///
/// Server-side record of issued refresh tokens, keyed by session id (jti).
/// Entries are:
/// - Created once per issuance with the full signed token string
/// - Hard-deleted on logout and on rotation
/// - Ignored once past `expires_at`, and swept by `purge_expired`
///
/// `RefreshLedger` is the capability the session issuer depends on. The
/// Postgres ledger backs production; the in-memory ledger backs tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, DatabaseError};

/// 32 base62 characters, roughly 190 bits
const SESSION_ID_LENGTH: usize = 32;

/// Generate a fresh session id from the OS random source
pub fn generate_session_id() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// One persisted refresh session
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub jti: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user_agent: String,
    pub ip_address: String,
}

impl LedgerEntry {
    fn matches(&self, user_id: Uuid, jti: &str, token: &str, now: DateTime<Utc>) -> bool {
        self.user_id == user_id && self.jti == jti && self.token == token && self.expires_at > now
    }
}

#[async_trait]
pub trait RefreshLedger: Send + Sync {
    /// Insert an entry. Fails with a unique-constraint conflict if the jti
    /// is already present.
    async fn save(&self, entry: LedgerEntry) -> Result<(), AppError>;

    /// Delete the entry for `jti`. Deleting an unknown jti is not an error.
    async fn revoke(&self, jti: &str) -> Result<(), AppError>;

    /// True only if an unexpired entry matches user, jti and exact token.
    async fn find_valid(&self, user_id: Uuid, jti: &str, token: &str) -> Result<bool, AppError>;

    /// Validate and delete in one step. Returns whether a valid entry was
    /// consumed.
    ///
    /// The default is `find_valid` followed by `revoke`, which leaves a
    /// window for two concurrent callers to both succeed. Stores that can
    /// do better should override it.
    async fn consume(&self, user_id: Uuid, jti: &str, token: &str) -> Result<bool, AppError> {
        if !self.find_valid(user_id, jti, token).await? {
            return Ok(false);
        }
        self.revoke(jti).await?;
        Ok(true)
    }

    /// Delete every entry past its expiry. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, AppError>;
}

/// Postgres-backed ledger (`refresh_tokens` table)
pub struct PgRefreshLedger {
    pool: PgPool,
}

impl PgRefreshLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshLedger for PgRefreshLedger {
    async fn save(&self, entry: LedgerEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (user_id, jti, token, expires_at, user_agent, ip_address, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.jti)
        .bind(&entry.token)
        .bind(entry.expires_at)
        .bind(&entry.user_agent)
        .bind(&entry.ip_address)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn revoke(&self, jti: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM refresh_tokens WHERE jti = $1")
            .bind(jti)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_valid(&self, user_id: Uuid, jti: &str, token: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM refresh_tokens
            WHERE user_id = $1 AND jti = $2 AND token = $3 AND expires_at > $4
            "#,
        )
        .bind(user_id)
        .bind(jti)
        .bind(token)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// A single `DELETE ... RETURNING`: of two concurrent rotations of the
    /// same token, only one sees the row.
    async fn consume(&self, user_id: Uuid, jti: &str, token: &str) -> Result<bool, AppError> {
        let consumed = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM refresh_tokens
            WHERE user_id = $1 AND jti = $2 AND token = $3 AND expires_at > $4
            RETURNING jti
            "#,
        )
        .bind(user_id)
        .bind(jti)
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(consumed.is_some())
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// In-process ledger for tests and single-node development
#[derive(Default)]
pub struct InMemoryRefreshLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl InMemoryRefreshLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LedgerEntry>>, AppError> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("Refresh ledger lock poisoned".to_string()))
    }

    /// All entries currently held for `user_id`, expired or not
    pub fn entries_for_user(&self, user_id: Uuid) -> Vec<LedgerEntry> {
        self.lock()
            .map(|entries| entries.values().filter(|e| e.user_id == user_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RefreshLedger for InMemoryRefreshLedger {
    async fn save(&self, entry: LedgerEntry) -> Result<(), AppError> {
        let mut entries = self.lock()?;
        if entries.contains_key(&entry.jti) {
            return Err(AppError::Database(DatabaseError::UniqueConstraintViolation(
                "refresh_tokens_jti_key".to_string(),
            )));
        }
        entries.insert(entry.jti.clone(), entry);
        Ok(())
    }

    async fn revoke(&self, jti: &str) -> Result<(), AppError> {
        self.lock()?.remove(jti);
        Ok(())
    }

    async fn find_valid(&self, user_id: Uuid, jti: &str, token: &str) -> Result<bool, AppError> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .get(jti)
            .map(|entry| entry.matches(user_id, jti, token, now))
            .unwrap_or(false))
    }

    async fn consume(&self, user_id: Uuid, jti: &str, token: &str) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        let valid = entries
            .get(jti)
            .map(|entry| entry.matches(user_id, jti, token, now))
            .unwrap_or(false);
        if valid {
            entries.remove(jti);
        }
        Ok(valid)
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

/// Spawn the background sweeper that deletes expired ledger entries.
///
/// Validity never depends on the sweeper; expired entries are already
/// ignored by `find_valid` and `consume`.
pub fn spawn_ledger_sweeper(
    ledger: Arc<dyn RefreshLedger>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match ledger.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Purged expired refresh sessions"),
                Err(e) => tracing::error!(error = %e, "Refresh ledger sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(user_id: Uuid, jti: &str, token: &str, ttl_seconds: i64) -> LedgerEntry {
        LedgerEntry {
            user_id,
            jti: jti.to_string(),
            token: token.to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_seconds),
            user_agent: "test-agent".to_string(),
            ip_address: "127.0.0.1".to_string(),
        }
    }

    #[test]
    fn test_generate_session_id() {
        let jti = generate_session_id();

        assert_eq!(jti.len(), SESSION_ID_LENGTH);
        assert!(jti.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(jti, generate_session_id());
    }

    #[tokio::test]
    async fn test_save_then_find_valid() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", 60)).await.unwrap();

        assert!(ledger.find_valid(user, "jti-1", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_valid_requires_exact_match() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", 60)).await.unwrap();

        assert!(!ledger.find_valid(user, "jti-1", "token-2").await.unwrap());
        assert!(!ledger.find_valid(Uuid::new_v4(), "jti-1", "token-1").await.unwrap());
        assert!(!ledger.find_valid(user, "jti-2", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_never_validates() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", -1)).await.unwrap();

        assert!(!ledger.find_valid(user, "jti-1", "token-1").await.unwrap());
        assert!(!ledger.consume(user, "jti-1", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_jti_conflicts() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", 60)).await.unwrap();

        let result = ledger.save(entry(user, "jti-1", "token-2", 60)).await;
        assert!(matches!(
            result,
            Err(AppError::Database(DatabaseError::UniqueConstraintViolation(_)))
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", 60)).await.unwrap();

        ledger.revoke("jti-1").await.unwrap();
        ledger.revoke("jti-1").await.unwrap();
        ledger.revoke("never-issued").await.unwrap();

        assert!(!ledger.find_valid(user, "jti-1", "token-1").await.unwrap());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", 60)).await.unwrap();

        assert!(ledger.consume(user, "jti-1", "token-1").await.unwrap());
        assert!(!ledger.consume(user, "jti-1", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_consume_with_wrong_token_keeps_entry() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "jti-1", "token-1", 60)).await.unwrap();

        assert!(!ledger.consume(user, "jti-1", "forged").await.unwrap());
        assert!(ledger.find_valid(user, "jti-1", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let ledger = InMemoryRefreshLedger::new();
        let user = Uuid::new_v4();
        ledger.save(entry(user, "live", "token-1", 60)).await.unwrap();
        ledger.save(entry(user, "dead", "token-2", -5)).await.unwrap();

        assert_eq!(ledger.purge_expired().await.unwrap(), 1);
        assert_eq!(ledger.entries_for_user(user).len(), 1);
        assert_eq!(ledger.entries_for_user(user)[0].jti, "live");
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let ledger = Arc::new(InMemoryRefreshLedger::new());
        let user = Uuid::new_v4();
        ledger.save(entry(user, "dead", "token", -5)).await.unwrap();

        let handle = spawn_ledger_sweeper(ledger.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(ledger.is_empty());
    }
}
