/// Double-submit CSRF tokens
///
/// The token is a random value handed out in a non-HttpOnly cookie; the
/// client echoes it in `X-CSRF-Token`. Cookie and header equality is the
/// whole check. Nothing is stored server-side.

use actix_web::http::Method;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

pub const CSRF_HEADER: &str = "X-CSRF-Token";

const CSRF_TOKEN_LENGTH: usize = 32;

pub fn generate_csrf_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(CSRF_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Safe methods skip the check; every other verb is treated as
/// state-changing.
pub fn requires_csrf(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Both values present, non-empty and byte-equal.
pub fn csrf_tokens_match(cookie: Option<&str>, header: Option<&str>) -> bool {
    match (cookie, header) {
        (Some(cookie), Some(header)) => {
            !cookie.is_empty() && cookie.as_bytes() == header.as_bytes()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_random() {
        let first = generate_csrf_token();
        let second = generate_csrf_token();

        assert_eq!(first.len(), CSRF_TOKEN_LENGTH);
        assert_ne!(first, second);
    }

    #[test]
    fn test_safe_methods_skip_check() {
        assert!(!requires_csrf(&Method::GET));
        assert!(!requires_csrf(&Method::HEAD));
        assert!(!requires_csrf(&Method::OPTIONS));
        assert!(requires_csrf(&Method::POST));
        assert!(requires_csrf(&Method::PUT));
        assert!(requires_csrf(&Method::PATCH));
        assert!(requires_csrf(&Method::DELETE));
    }

    #[test]
    fn test_matching() {
        assert!(csrf_tokens_match(Some("abc"), Some("abc")));
        assert!(!csrf_tokens_match(Some("abc"), Some("abd")));
        assert!(!csrf_tokens_match(Some("abc"), None));
        assert!(!csrf_tokens_match(None, Some("abc")));
        assert!(!csrf_tokens_match(Some(""), Some("")));
        assert!(!csrf_tokens_match(None, None));
    }
}
