/// Access Guard Middleware
///
/// Verifies the access token cookie on every protected request and injects
/// the authenticated identity into request extensions for route handlers.
/// Access tokens are stateless: this guard never consults the refresh
/// ledger.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;
use uuid::Uuid;

use crate::auth::cookies::ACCESS_COOKIE;
use crate::auth::TokenCodec;
use crate::error::{AppError, AuthError};

/// Identity attached to a request that passed the access guard
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
}

pub struct AccessGuard {
    codec: Rc<TokenCodec>,
}

impl AccessGuard {
    pub fn new(codec: TokenCodec) -> Self {
        Self { codec: Rc::new(codec) }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AccessGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AccessGuardService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(AccessGuardService {
            service: Rc::new(service),
            codec: self.codec.clone(),
        }))
    }
}

pub struct AccessGuardService<S> {
    service: Rc<S>,
    codec: Rc<TokenCodec>,
}

impl<S> AccessGuardService<S> {
    fn authenticate(&self, req: &ServiceRequest) -> Result<AuthenticatedUser, AppError> {
        let token = req
            .cookie(ACCESS_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                tracing::warn!(path = %req.path(), "Missing access token cookie");
                AppError::from(AuthError::Unauthenticated)
            })?;

        let claims = self.codec.parse_and_verify(&token).map_err(|e| {
            tracing::warn!(path = %req.path(), cause = %e, "Access token rejected");
            AppError::from(AuthError::Unauthenticated)
        })?;

        let user_id = claims
            .user_id()
            .map_err(|_| AppError::from(AuthError::Unauthenticated))?;

        Ok(AuthenticatedUser {
            user_id,
            email: claims.email,
        })
    }
}

impl<S, B> Service<ServiceRequest> for AccessGuardService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        match self.authenticate(&req) {
            Ok(user) => {
                tracing::debug!(user_id = %user.user_id, "Access token validated");
                req.extensions_mut().insert(user);

                let service = self.service.clone();
                Box::pin(async move { service.call(req).await })
            }
            Err(e) => Box::pin(async move { Err(e.into()) }),
        }
    }
}
