/// Session Issuer
///
/// Orchestrates token issuance, refresh rotation and logout on top of the
/// two token codecs and the refresh ledger. Every refresh-flow failure is
/// collapsed to `InvalidRefresh` for the caller; the precise cause is only
/// logged.

use actix_web::HttpRequest;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::claims::Claims;
use crate::auth::csrf::generate_csrf_token;
use crate::auth::jwt::TokenCodec;
use crate::auth::refresh_token::{generate_session_id, LedgerEntry, RefreshLedger};
use crate::configuration::AuthSettings;
use crate::error::{AppError, AuthError, DatabaseError};
use crate::store::bounded;

/// Fresh session ids are regenerated this many times on a ledger conflict
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// The identity a session is issued for
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
}

/// Audit metadata stored with each refresh session
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn from_request(req: &HttpRequest) -> Self {
        // Socket peer only; forwarding headers are client-controlled
        let ip_address = req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = req
            .headers()
            .get(actix_web::http::header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        Self { ip_address, user_agent }
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Everything produced by one issuance; never persisted as a whole
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub pair: TokenPair,
    pub csrf_token: String,
    pub session_id: String,
    pub user_id: Uuid,
    pub access_ttl: i64,
    pub refresh_ttl: i64,
    pub csrf_ttl: i64,
}

pub struct SessionIssuer {
    access: TokenCodec,
    refresh: TokenCodec,
    ledger: Arc<dyn RefreshLedger>,
    issuer: String,
    access_ttl: i64,
    refresh_ttl: i64,
    csrf_ttl: i64,
    store_timeout: Duration,
}

impl SessionIssuer {
    pub fn new(settings: &AuthSettings, ledger: Arc<dyn RefreshLedger>) -> Self {
        Self {
            access: TokenCodec::new(&settings.access_secret, &settings.issuer),
            refresh: TokenCodec::new(&settings.refresh_secret, &settings.issuer),
            ledger,
            issuer: settings.issuer.clone(),
            access_ttl: settings.access_token_expiry,
            refresh_ttl: settings.refresh_token_expiry,
            csrf_ttl: settings.csrf_token_expiry,
            store_timeout: settings.store_timeout(),
        }
    }

    /// Codec for access tokens, handed to the access guard
    pub fn access_codec(&self) -> &TokenCodec {
        &self.access
    }

    /// Issue a token pair and CSRF token for `user`.
    ///
    /// Writes exactly one ledger entry.
    pub async fn issue(
        &self,
        user: &SessionUser,
        client: &ClientInfo,
    ) -> Result<IssuedSession, AppError> {
        for attempt in 1..=MAX_ISSUE_ATTEMPTS {
            let session = self.sign_pair(user)?;
            let entry = LedgerEntry {
                user_id: user.id,
                jti: session.session_id.clone(),
                token: session.pair.refresh_token.clone(),
                expires_at: session.pair.refresh_expires_at,
                user_agent: client.user_agent.clone(),
                ip_address: client.ip_address.clone(),
            };

            let saved =
                bounded(self.store_timeout, "refresh_ledger.save", self.ledger.save(entry)).await;
            match saved {
                Ok(()) => {
                    tracing::info!(
                        user_id = %user.id,
                        session_id = %session.session_id,
                        ip = %client.ip_address,
                        "Session issued"
                    );
                    return Ok(session);
                }
                Err(AppError::Database(DatabaseError::UniqueConstraintViolation(_))) => {
                    tracing::error!(
                        user_id = %user.id,
                        attempt,
                        "Session id collision in refresh ledger"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal("Could not allocate a unique session id".to_string()))
    }

    fn sign_pair(&self, user: &SessionUser) -> Result<IssuedSession, AppError> {
        let now = Utc::now();
        let session_id = generate_session_id();

        let claims = |ttl: i64| {
            Claims::new(user.id, user.email.clone(), now, ttl, self.issuer.clone())
                .with_session_id(session_id.clone())
        };
        let access_claims = claims(self.access_ttl);
        let refresh_claims = claims(self.refresh_ttl);

        let access_token = self.access.sign(&access_claims)?;
        let refresh_token = self.refresh.sign(&refresh_claims)?;

        Ok(IssuedSession {
            pair: TokenPair {
                access_token,
                refresh_token,
                access_expires_at: now + ChronoDuration::seconds(self.access_ttl),
                refresh_expires_at: now + ChronoDuration::seconds(self.refresh_ttl),
            },
            csrf_token: generate_csrf_token(),
            session_id,
            user_id: user.id,
            access_ttl: self.access_ttl,
            refresh_ttl: self.refresh_ttl,
            csrf_ttl: self.csrf_ttl,
        })
    }

    /// Exchange a refresh token for a new session.
    ///
    /// The old ledger entry is consumed (checked and deleted in one ledger
    /// call) before the replacement is issued, so a refresh token works at
    /// most once.
    ///
    /// # Errors
    /// - `InvalidRefresh` for a missing, forged, expired, revoked or reused token
    /// - `Internal` when the ledger is unavailable
    pub async fn rotate(
        &self,
        presented: Option<&str>,
        client: &ClientInfo,
    ) -> Result<IssuedSession, AppError> {
        let token = match presented {
            Some(token) if !token.is_empty() => token,
            _ => {
                tracing::warn!("Refresh attempted without a refresh token");
                return Err(AuthError::InvalidRefresh.into());
            }
        };

        let claims = self.refresh.parse_and_verify(token).map_err(|e| {
            tracing::warn!(cause = %e, "Refresh token rejected");
            AppError::from(AuthError::InvalidRefresh)
        })?;

        let (user_id, jti) = match (claims.user_id(), claims.jti.as_deref()) {
            (Ok(user_id), Some(jti)) => (user_id, jti),
            _ => {
                tracing::warn!("Refresh token without subject or session id");
                return Err(AuthError::InvalidRefresh.into());
            }
        };

        let consumed = bounded(
            self.store_timeout,
            "refresh_ledger.consume",
            self.ledger.consume(user_id, jti, token),
        )
        .await?;

        if !consumed {
            tracing::warn!(
                user_id = %user_id,
                session_id = %jti,
                "Refresh token not in ledger (revoked, rotated or replayed)"
            );
            return Err(AuthError::InvalidRefresh.into());
        }

        let user = SessionUser {
            id: user_id,
            email: claims.email,
        };
        self.issue(&user, client).await
    }

    /// Best-effort logout. Never fails: an unparseable token or a ledger
    /// error is only logged.
    pub async fn revoke_session(&self, presented: Option<&str>) {
        let Some(token) = presented.filter(|t| !t.is_empty()) else {
            return;
        };

        let claims = match self.refresh.parse_and_verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(cause = %e, "Logout with unusable refresh token");
                return;
            }
        };

        let Some(jti) = claims.jti.as_deref() else {
            return;
        };

        match bounded(self.store_timeout, "refresh_ledger.revoke", self.ledger.revoke(jti)).await {
            Ok(()) => tracing::info!(user_id = %claims.sub, session_id = %jti, "Session revoked"),
            Err(e) => {
                tracing::error!(error = %e, session_id = %jti, "Failed to revoke session on logout")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh_token::InMemoryRefreshLedger;
    use async_trait::async_trait;

    fn settings() -> AuthSettings {
        AuthSettings {
            access_secret: "access-secret-key-at-least-32-characters".to_string(),
            refresh_secret: "refresh-secret-key-at-least-32-characters".to_string(),
            issuer: "test".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 3600,
            csrf_token_expiry: 900,
            bcrypt_cost: 4,
            store_timeout_ms: 200,
            ledger_sweep_interval: 0,
        }
    }

    fn alice() -> SessionUser {
        SessionUser {
            id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
        }
    }

    fn issuer_with_ledger() -> (SessionIssuer, Arc<InMemoryRefreshLedger>) {
        let ledger = Arc::new(InMemoryRefreshLedger::new());
        (SessionIssuer::new(&settings(), ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_issue_writes_one_ledger_entry() {
        let (issuer, ledger) = issuer_with_ledger();
        let user = alice();

        let session = issuer.issue(&user, &ClientInfo::default()).await.unwrap();

        let entries = ledger.entries_for_user(user.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].jti, session.session_id);
        assert_eq!(entries[0].token, session.pair.refresh_token);
        assert!(session.pair.refresh_expires_at > session.pair.access_expires_at);
        assert!(!session.csrf_token.is_empty());
    }

    #[tokio::test]
    async fn test_access_and_refresh_use_distinct_secrets() {
        let (issuer, _) = issuer_with_ledger();
        let session = issuer.issue(&alice(), &ClientInfo::default()).await.unwrap();

        assert!(issuer.access_codec().parse_and_verify(&session.pair.access_token).is_ok());
        assert!(issuer.access_codec().parse_and_verify(&session.pair.refresh_token).is_err());
        assert!(issuer.refresh.parse_and_verify(&session.pair.access_token).is_err());
    }

    #[tokio::test]
    async fn test_rotate_is_single_use() {
        let (issuer, ledger) = issuer_with_ledger();
        let user = alice();
        let original = issuer.issue(&user, &ClientInfo::default()).await.unwrap();

        let rotated = issuer
            .rotate(Some(&original.pair.refresh_token), &ClientInfo::default())
            .await
            .unwrap();
        assert_ne!(rotated.pair.refresh_token, original.pair.refresh_token);
        assert_ne!(rotated.session_id, original.session_id);

        let entries = ledger.entries_for_user(user.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].jti, rotated.session_id);

        let replay = issuer
            .rotate(Some(&original.pair.refresh_token), &ClientInfo::default())
            .await;
        assert!(matches!(replay, Err(AppError::Auth(AuthError::InvalidRefresh))));
    }

    #[tokio::test]
    async fn test_rotate_rejects_missing_and_forged_tokens() {
        let (issuer, _) = issuer_with_ledger();

        for presented in [None, Some(""), Some("not.a.token")] {
            let result = issuer.rotate(presented, &ClientInfo::default()).await;
            assert!(matches!(result, Err(AppError::Auth(AuthError::InvalidRefresh))));
        }
    }

    #[tokio::test]
    async fn test_rotate_rejects_validly_signed_token_missing_from_ledger() {
        let (issuer, ledger) = issuer_with_ledger();
        let session = issuer.issue(&alice(), &ClientInfo::default()).await.unwrap();
        ledger.revoke(&session.session_id).await.unwrap();

        let result = issuer.rotate(Some(&session.pair.refresh_token), &ClientInfo::default()).await;
        assert!(matches!(result, Err(AppError::Auth(AuthError::InvalidRefresh))));
    }

    #[tokio::test]
    async fn test_rotate_rejects_access_token() {
        let (issuer, _) = issuer_with_ledger();
        let session = issuer.issue(&alice(), &ClientInfo::default()).await.unwrap();

        let result = issuer.rotate(Some(&session.pair.access_token), &ClientInfo::default()).await;
        assert!(matches!(result, Err(AppError::Auth(AuthError::InvalidRefresh))));
    }

    #[tokio::test]
    async fn test_revoke_session_never_fails() {
        let (issuer, ledger) = issuer_with_ledger();
        let user = alice();
        let session = issuer.issue(&user, &ClientInfo::default()).await.unwrap();

        issuer.revoke_session(None).await;
        issuer.revoke_session(Some("garbage")).await;
        assert_eq!(ledger.entries_for_user(user.id).len(), 1);

        issuer.revoke_session(Some(&session.pair.refresh_token)).await;
        assert!(ledger.entries_for_user(user.id).is_empty());

        issuer.revoke_session(Some(&session.pair.refresh_token)).await;
    }

    /// Ledger whose every call hangs past the store timeout
    struct StalledLedger;

    #[async_trait]
    impl RefreshLedger for StalledLedger {
        async fn save(&self, _entry: LedgerEntry) -> Result<(), AppError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn revoke(&self, _jti: &str) -> Result<(), AppError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn find_valid(
            &self,
            _user_id: Uuid,
            _jti: &str,
            _token: &str,
        ) -> Result<bool, AppError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }

        async fn purge_expired(&self) -> Result<u64, AppError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_stalled_ledger_fails_closed() {
        let issuer = SessionIssuer::new(&settings(), Arc::new(StalledLedger));
        let codec = TokenCodec::new(&settings().refresh_secret, "test");
        let user = alice();
        let claims = Claims::new(user.id, user.email, Utc::now(), 60, "test".to_string())
            .with_session_id(generate_session_id());
        let token = codec.sign(&claims).unwrap();

        let result = issuer.rotate(Some(&token), &ClientInfo::default()).await;
        assert!(matches!(result, Err(AppError::Database(DatabaseError::Timeout))));

        let result = issuer.issue(&alice(), &ClientInfo::default()).await;
        assert!(matches!(result, Err(AppError::Database(DatabaseError::Timeout))));
    }

    /// Ledger that reports every jti as already taken
    struct CollidingLedger;

    #[async_trait]
    impl RefreshLedger for CollidingLedger {
        async fn save(&self, _entry: LedgerEntry) -> Result<(), AppError> {
            let constraint = "refresh_tokens_pkey".to_string();
            Err(DatabaseError::UniqueConstraintViolation(constraint).into())
        }

        async fn revoke(&self, _jti: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn find_valid(
            &self,
            _user_id: Uuid,
            _jti: &str,
            _token: &str,
        ) -> Result<bool, AppError> {
            Ok(false)
        }

        async fn purge_expired(&self) -> Result<u64, AppError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_jti_conflict_is_not_reported_as_user_conflict() {
        let issuer = SessionIssuer::new(&settings(), Arc::new(CollidingLedger));

        let result = issuer.issue(&alice(), &ClientInfo::default()).await;
        assert!(matches!(result, Err(AppError::Internal(_))));
    }

    #[test]
    fn test_client_info_ignores_forwarding_headers() {
        let req = actix_web::test::TestRequest::default()
            .peer_addr("10.0.0.7:51234".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.9"))
            .insert_header(("Forwarded", "for=203.0.113.9"))
            .insert_header((actix_web::http::header::USER_AGENT, "test-agent"))
            .to_http_request();

        let client = ClientInfo::from_request(&req);
        assert_eq!(client.ip_address, "10.0.0.7");
        assert_eq!(client.user_agent, "test-agent");
    }
}
