use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialVerifier, RefreshLedger, SessionIssuer};
use crate::configuration::AuthSettings;
use crate::error::{AppError, ValidationError};
use crate::logger::LoggerMiddleware;
use crate::middleware::{AccessGuard, CsrfGuard};
use crate::routes::{get_current_user, health_check, login, logout, refresh, register};
use crate::users::UserStore;

/// Shared, read-only request state
///
/// Built once at startup from explicit settings; nothing here is global.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<SessionIssuer>,
    pub credentials: CredentialVerifier,
    pub store_timeout: Duration,
}

impl AppState {
    pub fn new(
        settings: &AuthSettings,
        users: Arc<dyn UserStore>,
        ledger: Arc<dyn RefreshLedger>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            users,
            sessions: Arc::new(SessionIssuer::new(settings, ledger)),
            credentials: CredentialVerifier::new(settings.bcrypt_cost)?,
            store_timeout: settings.store_timeout(),
        })
    }
}

/// Routes and guards, shared by the server and the in-process test app
pub fn configure(cfg: &mut web::ServiceConfig, state: AppState) {
    let access_codec = state.sessions.access_codec().clone();

    cfg.app_data(web::Data::new(state))
        .app_data(web::JsonConfig::default().error_handler(|err, _req| {
            AppError::from(ValidationError::MalformedBody(err.to_string())).into()
        }))
        // Public routes
        .route("/health_check", web::get().to(health_check))
        .route("/auth/register", web::post().to(register))
        .route("/auth/login", web::post().to(login))
        .route("/auth/refresh", web::post().to(refresh))
        .route("/auth/logout", web::post().to(logout))
        // Protected routes: access guard first, then CSRF
        .service(
            web::scope("/api")
                .wrap(CsrfGuard)
                .wrap(AccessGuard::new(access_codec))
                .route("/me", web::get().to(get_current_user)),
        );
}

pub fn run(listener: TcpListener, state: AppState) -> Result<Server, std::io::Error> {
    let server = HttpServer::new(move || {
        let state = state.clone();
        App::new()
            .wrap(LoggerMiddleware)
            .configure(move |cfg| configure(cfg, state))
    })
    .listen(listener)?
    .run();

    Ok(server)
}
