/// Authentication Routes
///
/// Registration, login, refresh rotation, logout and the current identity.
/// Tokens travel only in cookies; response bodies carry expiry metadata.

use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::cookies::{cleared_cookies, is_secure, session_cookies, REFRESH_COOKIE};
use crate::auth::{validate_password_strength, ClientInfo, IssuedSession, SessionUser};
use crate::error::{AppError, AuthError, ValidationError};
use crate::middleware::AuthenticatedUser;
use crate::startup::AppState;
use crate::store::bounded;
use crate::users::NewUser;
use crate::validators::{is_valid_email, is_valid_username};

/// User registration request
#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// User login request
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user_id: String,
}

/// Returned by login and refresh alongside the session cookies
#[derive(Serialize)]
pub struct SessionResponse {
    pub message: String,
    pub access_expires_at: String,
    pub refresh_expires_at: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: String,
    pub email: String,
}

fn session_response(session: &IssuedSession, secure: bool) -> HttpResponse {
    let mut response = HttpResponse::Ok();
    for cookie in session_cookies(session, secure) {
        response.cookie(cookie);
    }
    response.json(SessionResponse {
        message: "ok".to_string(),
        access_expires_at: session.pair.access_expires_at.to_rfc3339(),
        refresh_expires_at: session.pair.refresh_expires_at.to_rfc3339(),
    })
}

/// POST /auth/register
///
/// # Errors
/// - 400: invalid payload (username, email or password rules)
/// - 409: username or email already registered
/// - 500: hashing or store failure
pub async fn register(
    form: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let username = is_valid_username(&form.username)?;
    let email = is_valid_email(&form.email)?;
    validate_password_strength(&form.password)?;

    let credentials = state.credentials.clone();
    let password = form.password;
    let password_hash = web::block(move || credentials.hash(&password)).await??;

    let user = bounded(
        state.store_timeout,
        "users.create",
        state.users.create(NewUser {
            username,
            email,
            password_hash,
        }),
    )
    .await?;

    tracing::info!(user_id = %user.id, "User registered");

    Ok(HttpResponse::Created().json(RegisterResponse {
        message: "registered".to_string(),
        user_id: user.id.to_string(),
    }))
}

/// POST /auth/login
///
/// Unknown email and wrong password are indistinguishable, in body and in
/// timing.
///
/// # Errors
/// - 400: invalid payload
/// - 401: invalid credentials
/// - 500: store failure
pub async fn login(
    req: HttpRequest,
    form: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let email = is_valid_email(&form.email)?;
    if form.password.is_empty() {
        return Err(ValidationError::EmptyField("password").into());
    }

    let user = bounded(
        state.store_timeout,
        "users.find_by_email",
        state.users.find_by_email(&email),
    )
    .await?;

    let credentials = state.credentials.clone();
    let stored_hash = user.as_ref().map(|u| u.password_hash.clone());
    let password = form.password;
    let matched = web::block(move || credentials.verify(&password, stored_hash.as_deref())).await?;

    let user = match user {
        Some(user) if matched => user,
        _ => {
            tracing::warn!(email = %email, "Failed login");
            return Err(AuthError::InvalidCredentials.into());
        }
    };

    let session = state
        .sessions
        .issue(
            &SessionUser {
                id: user.id,
                email: user.email,
            },
            &ClientInfo::from_request(&req),
        )
        .await?;

    Ok(session_response(&session, is_secure(&req)))
}

/// POST /auth/refresh
///
/// Rotates the refresh cookie: the presented token is consumed and a new
/// pair is issued.
///
/// # Errors
/// - 401: missing, invalid, expired, revoked or replayed refresh token
/// - 500: ledger failure
pub async fn refresh(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let presented = req.cookie(REFRESH_COOKIE).map(|c| c.value().to_string());

    let session = state
        .sessions
        .rotate(presented.as_deref(), &ClientInfo::from_request(&req))
        .await?;

    tracing::info!(user_id = %session.user_id, "Session rotated");
    Ok(session_response(&session, is_secure(&req)))
}

/// POST /auth/logout
///
/// Always 200 and always clears all three cookies.
pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let presented = req.cookie(REFRESH_COOKIE).map(|c| c.value().to_string());
    state.sessions.revoke_session(presented.as_deref()).await;

    let mut response = HttpResponse::Ok();
    for cookie in cleared_cookies(is_secure(&req)) {
        response.cookie(cookie);
    }
    response.json(MessageResponse {
        message: "logged out".to_string(),
    })
}

/// GET /api/me
///
/// Identity placed in request scope by the access guard.
pub async fn get_current_user(user: web::ReqData<AuthenticatedUser>) -> HttpResponse {
    HttpResponse::Ok().json(MeResponse {
        user_id: user.user_id.to_string(),
        email: user.email.clone(),
    })
}
