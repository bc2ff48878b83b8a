//! Second factor: TOTP and emailed one-time codes
//!
//! A login that passed the password check but still owes a second factor is
//! parked as a [`PendingTwoFactor`] in the client's session context.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

use super::seconds;
use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::users::{User, UserId};

/// Setup page reachable without a configured second factor
pub const TWO_FACTOR_SETUP_PATH: &str = "/2fa/setup";

/// Logout is always reachable
pub const LOGOUT_PATH: &str = "/logout";

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECS: u64 = 30;
/// Accepted clock drift in steps either side
const TOTP_SKEW: u8 = 1;
const TOTP_SECRET_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorMethod {
    Totp,
    EmailCode,
}

impl TwoFactorMethod {
    /// Method a user will be asked for; TOTP wins when both are enabled
    pub fn for_user(user: &User) -> Option<Self> {
        if user.totp_enabled() {
            Some(TwoFactorMethod::Totp)
        } else if user.email_2fa_enabled {
            Some(TwoFactorMethod::EmailCode)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TwoFactorMethod::Totp => "totp",
            TwoFactorMethod::EmailCode => "email_code",
        }
    }
}

/// A login waiting for its second factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTwoFactor {
    pub user_id: UserId,
    pub method: TwoFactorMethod,
    /// SHA-256 of the emailed code
    #[serde(skip_serializing)]
    pub(crate) code_hash: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub failed_attempts: u32,
}

impl PendingTwoFactor {
    pub fn new(user_id: UserId, method: TwoFactorMethod, ttl_secs: u64) -> Self {
        Self {
            user_id,
            method,
            code_hash: None,
            expires_at: Utc::now() + seconds(ttl_secs),
            failed_attempts: 0,
        }
    }

    pub fn with_code_hash(mut self, code_hash: String) -> Self {
        self.code_hash = Some(code_hash);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// New random TOTP secret, base32 encoded
pub fn generate_totp_secret() -> String {
    let mut bytes = [0u8; TOTP_SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes);
    Secret::Raw(bytes.to_vec()).to_encoded().to_string()
}

/// Authenticator for a base32 secret
pub fn totp_for(secret: &str) -> AppResult<TOTP> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|e| AppError::Internal(format!("Invalid TOTP secret: {e:?}")))?;
    TOTP::new(Algorithm::SHA1, TOTP_DIGITS, TOTP_SKEW, TOTP_STEP_SECS, bytes)
        .map_err(|e| AppError::Internal(format!("Invalid TOTP parameters: {e:?}")))
}

/// Check a code from the authenticator app against the current time window
pub fn verify_totp(secret: &str, code: &str) -> AppResult<bool> {
    let totp = totp_for(secret)?;
    Ok(totp.check_current(code.trim()).unwrap_or(false))
}

/// Six-digit code for email delivery
pub fn generate_email_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

/// Constant-time comparison of an entered code with the stored hash
pub fn verify_email_code(code: &str, expected_hash: &str) -> bool {
    hash_code(code)
        .as_bytes()
        .ct_eq(expected_hash.as_bytes())
        .into()
}

/// Outcome of the per-request second-factor gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    RedirectToSetup,
}

/// Send users without a second factor to the setup page when policy demands one
pub fn two_factor_gate(user: &User, path: &str, config: &AuthConfig) -> GateDecision {
    if !config.require_two_factor || user.is_2fa_enabled() {
        return GateDecision::Proceed;
    }

    let allowed = [TWO_FACTOR_SETUP_PATH, LOGOUT_PATH]
        .iter()
        .any(|allowed| path == *allowed || path.starts_with(&format!("{allowed}/")));
    if allowed {
        GateDecision::Proceed
    } else {
        GateDecision::RedirectToSetup
    }
}
