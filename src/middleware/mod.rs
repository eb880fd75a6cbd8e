/// Middleware module
///
/// Request-time guards for protected routes.

mod access_guard;
mod csrf_guard;

pub use access_guard::{AccessGuard, AuthenticatedUser};
pub use csrf_guard::CsrfGuard;
