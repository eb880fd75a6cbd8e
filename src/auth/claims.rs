/// JWT Claims structure
///
/// The signed payload shared by access and refresh tokens. Refresh tokens
/// always carry `jti`, the session id that keys the refresh ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// User email
    pub email: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Issuer
    pub iss: String,
    /// Session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    /// Build claims issued at `now` and valid for `expiry_seconds`.
    pub fn new(
        user_id: Uuid,
        email: String,
        issued_at: DateTime<Utc>,
        expiry_seconds: i64,
        issuer: String,
    ) -> Self {
        let now = issued_at.timestamp();
        Self {
            sub: user_id.to_string(),
            email,
            exp: now + expiry_seconds,
            iat: now,
            iss: issuer,
            jti: None,
        }
    }

    pub fn with_session_id(mut self, jti: String) -> Self {
        self.jti = Some(jti);
        self
    }

    /// Extract user ID from claims
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub)
            .map_err(|_| AppError::Internal("Invalid user ID in token".to_string()))
    }
}
