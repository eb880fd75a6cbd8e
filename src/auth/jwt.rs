/// JWT Token Signing and Verification
///
/// A `TokenCodec` is bound to one secret. The service builds two of them,
/// one for access tokens and one for refresh tokens, so a leaked access
/// secret cannot forge refresh tokens.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::fmt;

use crate::auth::claims::Claims;
use crate::error::AppError;

/// The only accepted algorithm. Never read from the token header.
const ALGORITHM: Algorithm = Algorithm::HS256;

/// Why a token failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    InvalidSignature,
    Malformed,
    Expired,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::InvalidSignature => write!(f, "invalid signature"),
            TokenError::Malformed => write!(f, "malformed token"),
            TokenError::Expired => write!(f, "token expired"),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            // A foreign algorithm is treated as a forged signature.
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                TokenError::InvalidSignature
            }
            _ => TokenError::Malformed,
        }
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(secret: &str, issuer: &str) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.algorithms = vec![ALGORITHM];
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Sign a claim set
    ///
    /// # Errors
    /// Returns `Internal` if the claims cannot be encoded
    pub fn sign(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::new(ALGORITHM), claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Token generation failed: {}", e)))
    }

    /// Parse a token and verify signature, algorithm, issuer and expiry
    pub fn parse_and_verify(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(TokenError::from)?;

        if claims.exp <= claims.iat {
            return Err(TokenError::Malformed);
        }

        Ok(claims)
    }
}
