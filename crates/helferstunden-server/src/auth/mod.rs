//! Authentication core
//!
//! Credential checks with brute-force lockout, server-side sessions with a
//! sliding expiry, and the second-factor state machine. The HTTP layer owns a
//! [`SessionContext`] per client and hands it to [`AuthService`]; a
//! successful lookup yields the [`Actor`] that workflow operations expect.

mod password;
mod service;
mod session;
mod two_factor;

use chrono::Duration;

use crate::users::{User, UserId};

pub use password::{
    hash_password, spawn_hash_password, spawn_verify_password, validate_password_policy,
    verify_password, MIN_PASSWORD_LENGTH,
};
pub use service::{AuthService, LoginOutcome};
pub use session::{
    generate_token, hash_token, session_reference, PgSessionRepository, Session, SessionContext,
    SessionRepository,
};
pub use two_factor::{
    generate_email_code, generate_totp_secret, hash_code, totp_for, two_factor_gate,
    verify_email_code, verify_totp, GateDecision, PendingTwoFactor, TwoFactorMethod,
    LOGOUT_PATH, TWO_FACTOR_SETUP_PATH,
};

#[cfg(test)]
pub use session::MockSessionRepository;

/// Longest duration accepted from configuration (ten years)
const MAX_CONFIGURED_SECS: u64 = 10 * 365 * 24 * 3600;

/// Configured seconds as a duration, clamped to a sane range
pub(crate) fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_CONFIGURED_SECS) as i64)
}

/// An authenticated user acting through one client
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub user: User,
    pub ip_address: Option<String>,
    /// Audit reference of the session, never the token itself
    pub session_id: Option<String>,
}

impl Actor {
    pub fn new(user: User) -> Self {
        Self {
            user,
            ip_address: None,
            session_id: None,
        }
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn id(&self) -> UserId {
        self.user.id
    }
}
