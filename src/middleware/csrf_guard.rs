/// CSRF Guard Middleware
///
/// Double-submit check for state-changing methods: the `csrf` cookie and
/// the `X-CSRF-Token` header must both be present and equal.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::cookies::CSRF_COOKIE;
use crate::auth::csrf::{csrf_tokens_match, requires_csrf, CSRF_HEADER};
use crate::error::{AppError, AuthError};

pub struct CsrfGuard;

impl<S, B> Transform<S, ServiceRequest> for CsrfGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = CsrfGuardService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(CsrfGuardService {
            service: Rc::new(service),
        }))
    }
}

pub struct CsrfGuardService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for CsrfGuardService<S>
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
        if requires_csrf(req.method()) {
            let cookie = req.cookie(CSRF_COOKIE);
            let header = req
                .headers()
                .get(CSRF_HEADER)
                .and_then(|h| h.to_str().ok());

            if !csrf_tokens_match(cookie.as_ref().map(|c| c.value()), header) {
                tracing::warn!(
                    method = %req.method(),
                    path = %req.path(),
                    cookie_present = cookie.is_some(),
                    header_present = header.is_some(),
                    "CSRF validation failed"
                );
                return Box::pin(async { Err(AppError::from(AuthError::CsrfRejected).into()) });
            }
        }

        let service = self.service.clone();
        Box::pin(async move { service.call(req).await })
    }
}
