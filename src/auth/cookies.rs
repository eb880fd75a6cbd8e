/// Session cookies
///
/// All three cookies are `Path=/` and `SameSite=Strict`; `Secure` follows
/// the request scheme.

use actix_web::cookie::time::Duration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::HttpRequest;

use crate::auth::session::IssuedSession;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";
pub const CSRF_COOKIE: &str = "csrf";

/// True when the request reached us over TLS
pub fn is_secure(req: &HttpRequest) -> bool {
    req.connection_info().scheme() == "https"
}

fn build<'c>(
    name: &'c str,
    value: String,
    max_age: Duration,
    http_only: bool,
    secure: bool,
) -> Cookie<'c> {
    Cookie::build(name, value)
        .path("/")
        .http_only(http_only)
        .same_site(SameSite::Strict)
        .secure(secure)
        .max_age(max_age)
        .finish()
}

/// The three cookies handed out on login and refresh
pub fn session_cookies(session: &IssuedSession, secure: bool) -> Vec<Cookie<'static>> {
    vec![
        build(
            ACCESS_COOKIE,
            session.pair.access_token.clone(),
            Duration::seconds(session.access_ttl),
            true,
            secure,
        ),
        build(
            REFRESH_COOKIE,
            session.pair.refresh_token.clone(),
            Duration::seconds(session.refresh_ttl),
            true,
            secure,
        ),
        build(
            CSRF_COOKIE,
            session.csrf_token.clone(),
            Duration::seconds(session.csrf_ttl),
            false,
            secure,
        ),
    ]
}

/// Removal cookies for all three names
pub fn cleared_cookies(secure: bool) -> Vec<Cookie<'static>> {
    [(ACCESS_COOKIE, true), (REFRESH_COOKIE, true), (CSRF_COOKIE, false)]
        .into_iter()
        .map(|(name, http_only)| build(name, String::new(), Duration::ZERO, http_only, secure))
        .collect()
}
