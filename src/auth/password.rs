/// Password Hashing and Verification
///
/// Credential Verifier: bcrypt with a configurable work factor, plus the
/// password strength rules applied at registration.

use bcrypt::{hash, verify};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{AppError, ValidationError};

const MIN_PASSWORD_LENGTH: usize = 8;
// bcrypt only reads the first 72 bytes
const MAX_PASSWORD_LENGTH: usize = 72;

/// Hash a password using bcrypt
///
/// # Errors
/// Returns `Internal` if bcrypt fails (e.g. cost out of range). This is
/// fatal to the registration attempt.
pub fn hash_password(password: &str, cost: u32) -> Result<String, AppError> {
    hash(password, cost).map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
}

/// Verify a password against its hash
///
/// A mismatch is a normal `false`. An unparseable stored hash is logged and
/// also reported as `false`.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match verify(password, hash) {
        Ok(matched) => matched,
        Err(e) => {
            tracing::error!(error = %e, "Stored password hash could not be verified");
            false
        }
    }
}

/// Validate password strength requirements
///
/// Requirements:
/// - 8 to 72 bytes
/// - At least one digit, one lowercase and one uppercase letter
pub fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::TooShort("password", MIN_PASSWORD_LENGTH));
    }

    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(ValidationError::TooLong("password", MAX_PASSWORD_LENGTH));
    }

    let has_digit = password.chars().any(|c| c.is_numeric());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_uppercase = password.chars().any(|c| c.is_uppercase());

    if !has_digit || !has_lowercase || !has_uppercase {
        return Err(ValidationError::WeakPassword);
    }

    Ok(())
}

/// Credential Verifier bound to a work factor
///
/// Holds a decoy hash made at construction so that a login for an unknown
/// account costs the same bcrypt round as a real one.
#[derive(Clone)]
pub struct CredentialVerifier {
    cost: u32,
    decoy_hash: String,
}

impl CredentialVerifier {
    pub fn new(cost: u32) -> Result<Self, AppError> {
        let decoy: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let decoy_hash = hash_password(&decoy, cost)?;
        Ok(Self { cost, decoy_hash })
    }

    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        hash_password(password, self.cost)
    }

    /// Verify against the stored hash, or against the decoy when the
    /// account does not exist. The decoy never matches.
    pub fn verify(&self, password: &str, stored_hash: Option<&str>) -> bool {
        match stored_hash {
            Some(stored) => verify_password(password, stored),
            None => {
                let _ = verify_password(password, &self.decoy_hash);
                false
            }
        }
    }
}
