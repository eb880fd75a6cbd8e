/// Authentication module
///
/// Password verification, token signing and verification, the refresh
/// ledger, session issuance and the cookies that carry it all.

mod claims;
pub mod cookies;
pub mod csrf;
mod jwt;
mod password;
mod refresh_token;
mod session;

pub use claims::Claims;
pub use jwt::{TokenCodec, TokenError};
pub use password::{hash_password, validate_password_strength, verify_password, CredentialVerifier};
pub use refresh_token::{
    generate_session_id, spawn_ledger_sweeper, InMemoryRefreshLedger, LedgerEntry, PgRefreshLedger,
    RefreshLedger,
};
pub use session::{ClientInfo, IssuedSession, SessionIssuer, SessionUser, TokenPair};
