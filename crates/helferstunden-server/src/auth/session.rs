//! Server-side sessions and the per-client session context

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use super::two_factor::PendingTwoFactor;
use crate::error::AppResult;
use crate::users::UserId;

/// Random bytes in a session token
const TOKEN_BYTES: usize = 32;

/// A server-side session record
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Session storage
///
/// Implementations may store the token in any form as long as `find` with the
/// clear token returns the session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: Session) -> AppResult<()>;

    async fn find(&self, token: String) -> AppResult<Option<Session>>;

    /// Move the expiry of a live session
    async fn touch(&self, token: String, expires_at: DateTime<Utc>) -> AppResult<()>;

    async fn delete(&self, token: String) -> AppResult<()>;

    /// Remove every session of `user_id` except `except_token`; returns the count
    async fn delete_all_for_user(
        &self,
        user_id: UserId,
        except_token: Option<String>,
    ) -> AppResult<u64>;
}

/// Fresh random session token, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of a token; only this form is persisted
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Short, non-reversible session reference for audit records
pub fn session_reference(token: &str) -> String {
    hash_token(token)[..16].to_string()
}

/// State carried between the requests of one client
///
/// Holds the session token once a login completed and the pending
/// second-factor state while one is outstanding. The HTTP layer persists it
/// in whatever cookie or store it uses.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub(crate) token: Option<String>,
    pub(crate) pending_2fa: Option<PendingTwoFactor>,
    pub ip_address: Option<String>,
}

impl SessionContext {
    pub fn new(ip_address: Option<String>) -> Self {
        Self {
            ip_address,
            ..Self::default()
        }
    }

    /// Context for a client that presented a session token
    pub fn with_token(token: impl Into<String>, ip_address: Option<String>) -> Self {
        Self {
            token: Some(token.into()),
            pending_2fa: None,
            ip_address,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn session_reference(&self) -> Option<String> {
        self.token().map(session_reference)
    }
}

/// PostgreSQL-backed session storage
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    user_id: i64,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn create(&self, session: Session) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, ip_address, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(hash_token(&session.token))
        .bind(session.user_id)
        .bind(session.ip_address)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, token: String) -> AppResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT user_id, ip_address, created_at, expires_at FROM sessions \
             WHERE token_hash = $1",
        )
        .bind(hash_token(&token))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Session {
            token,
            user_id: row.user_id,
            ip_address: row.ip_address,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }))
    }

    async fn touch(&self, token: String, expires_at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE sessions SET expires_at = $2, last_seen_at = NOW() WHERE token_hash = $1")
            .bind(hash_token(&token))
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, token: String) -> AppResult<()> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(hash_token(&token))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_all_for_user(
        &self,
        user_id: UserId,
        except_token: Option<String>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE user_id = $1 \
             AND ($2::text IS NULL OR token_hash <> $2)",
        )
        .bind(user_id)
        .bind(except_token.as_deref().map(hash_token))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_stable_and_hides_token() {
        let token = "abc123";
        assert_eq!(hash_token(token), hash_token(token));
        assert_ne!(hash_token(token), token);
        assert_eq!(session_reference(token).len(), 16);
    }

    #[test]
    fn test_context_without_token() {
        let ctx = SessionContext::new(Some("192.0.2.7".to_string()));
        assert_eq!(ctx.token(), None);
        assert_eq!(ctx.session_reference(), None);
    }
}
