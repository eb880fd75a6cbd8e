/// Input validators for registration and login payloads
/// Features:
/// 1. DoS protection: input length limits
/// 2. Email format validation (normalized to lowercase)
/// 3. Username charset validation

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ValidationError;

const MAX_EMAIL_LENGTH: usize = 254; // RFC 5321
const MIN_EMAIL_LENGTH: usize = 5;
const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 50;

lazy_static! {
    // RFC 5322 simplified email regex (practical validation)
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).expect("email regex is valid");
}

/// Validates an email address and returns it trimmed and lowercased
pub fn is_valid_email(email: &str) -> Result<String, ValidationError> {
    let trimmed = email.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("email"));
    }

    if trimmed.len() < MIN_EMAIL_LENGTH {
        return Err(ValidationError::TooShort("email", MIN_EMAIL_LENGTH));
    }

    if trimmed.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong("email", MAX_EMAIL_LENGTH));
    }

    if !EMAIL_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("email"));
    }

    // Local part over 64 octets is outside RFC 5321
    if trimmed.split('@').next().map(str::len).unwrap_or(0) > 64 {
        return Err(ValidationError::InvalidFormat("email"));
    }

    Ok(trimmed.to_lowercase())
}

/// Validates a username: ASCII alphanumeric, 3 to 50 characters
pub fn is_valid_username(username: &str) -> Result<String, ValidationError> {
    let trimmed = username.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("username"));
    }

    if trimmed.len() < MIN_USERNAME_LENGTH {
        return Err(ValidationError::TooShort("username", MIN_USERNAME_LENGTH));
    }

    if trimmed.len() > MAX_USERNAME_LENGTH {
        return Err(ValidationError::TooLong("username", MAX_USERNAME_LENGTH));
    }

    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidFormat("username"));
    }

    Ok(trimmed.to_string())
}
