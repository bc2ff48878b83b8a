//! Password hashing and policy

use tracing::warn;

use crate::error::{AppError, AppResult};

/// Minimum password length
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Hash `plain` with bcrypt at the given work factor
pub fn hash_password(plain: &str, cost: u32) -> AppResult<String> {
    bcrypt::hash(plain, cost).map_err(|e| AppError::Internal(format!("Password hashing failed: {e}")))
}

/// Check `plain` against a stored bcrypt hash
///
/// A malformed hash counts as a mismatch.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    match bcrypt::verify(plain, hash) {
        Ok(valid) => valid,
        Err(e) => {
            warn!(error = %e, "Stored password hash could not be parsed");
            false
        },
    }
}

/// [`hash_password`] on the blocking thread pool
pub async fn spawn_hash_password(plain: &str, cost: u32) -> AppResult<String> {
    let plain = plain.to_string();
    tokio::task::spawn_blocking(move || hash_password(&plain, cost))
        .await
        .map_err(|e| AppError::Internal(format!("Password hashing task failed: {e}")))?
}

/// [`verify_password`] on the blocking thread pool
pub async fn spawn_verify_password(plain: &str, hash: String) -> AppResult<bool> {
    let plain = plain.to_string();
    tokio::task::spawn_blocking(move || verify_password(&plain, &hash))
        .await
        .map_err(|e| AppError::Internal(format!("Password verification task failed: {e}")))
}

/// Enforce length and character-class rules
///
/// All violations are reported in one message.
pub fn validate_password_policy(plain: &str) -> AppResult<()> {
    let mut problems = Vec::new();

    if plain.chars().count() < MIN_PASSWORD_LENGTH {
        problems.push(format!("mindestens {MIN_PASSWORD_LENGTH} Zeichen"));
    }
    if !plain.chars().any(char::is_uppercase) {
        problems.push("einen Großbuchstaben".to_string());
    }
    if !plain.chars().any(char::is_lowercase) {
        problems.push("einen Kleinbuchstaben".to_string());
    }
    if !plain.chars().any(|c| c.is_ascii_digit()) {
        problems.push("eine Ziffer".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "Das Passwort muss {} enthalten.",
            problems.join(", ")
        )))
    }
}
