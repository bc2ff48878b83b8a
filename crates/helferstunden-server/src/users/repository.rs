//! User persistence
//!
//! [`UserDirectory`] is the read side every other component depends on;
//! [`UserStore`] carries the writes made by login tracking and user
//! administration. [`PgUserRepository`] implements both against PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use super::model::{Role, RoleSet, User, UserId};
use crate::error::{AppError, AppResult};

/// Read-only user lookups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> AppResult<Option<User>>;

    /// Case-insensitive lookup by login email
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>>;

    /// Active users holding `role`
    async fn find_by_role(&self, role: Role) -> AppResult<Vec<User>>;
}

/// Data for a user created through an invitation
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub roles: RoleSet,
    pub invitation_token_hash: String,
    pub invitation_expires_at: DateTime<Utc>,
}

/// Mutations on user records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Increment the failed-login counter and return the new value
    async fn record_failed_login(&self, user_id: UserId) -> AppResult<u32>;

    async fn reset_failed_logins(&self, user_id: UserId) -> AppResult<()>;

    /// Lock the account for `duration_secs` and reset the failure counter
    async fn lock_account(&self, user_id: UserId, duration_secs: u64) -> AppResult<()>;

    async fn update_password(&self, user_id: UserId, password_hash: String) -> AppResult<()>;

    async fn set_totp_secret(&self, user_id: UserId, secret: Option<String>) -> AppResult<()>;

    async fn set_email_2fa(&self, user_id: UserId, enabled: bool) -> AppResult<()>;

    /// Insert an inactive user awaiting invitation acceptance
    async fn create_invited(&self, user: NewUser) -> AppResult<User>;

    /// Resolve an invitation token hash to the user and the link's expiry
    async fn find_by_invitation(
        &self,
        token_hash: String,
    ) -> AppResult<Option<(User, DateTime<Utc>)>>;

    /// Set the first password, activate the account and consume the invitation
    async fn accept_invitation(&self, user_id: UserId, password_hash: String) -> AppResult<()>;

    async fn set_roles(&self, user_id: UserId, roles: RoleSet) -> AppResult<()>;

    async fn set_active(&self, user_id: UserId, active: bool) -> AppResult<()>;
}

/// PostgreSQL-backed user repository
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, email, name, is_active, roles, password_hash, totp_secret, \
     email_2fa_enabled, failed_login_attempts, locked_until, created_at";

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    name: String,
    is_active: bool,
    roles: Vec<String>,
    password_hash: Option<String>,
    totp_secret: Option<String>,
    email_2fa_enabled: bool,
    failed_login_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            name: row.name,
            is_active: row.is_active,
            roles: RoleSet::from_names(&row.roles),
            password_hash: row.password_hash,
            totp_secret: row.totp_secret,
            email_2fa_enabled: row.email_2fa_enabled,
            failed_login_attempts: u32::try_from(row.failed_login_attempts).unwrap_or(0),
            locked_until: row.locked_until,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvitedUserRow {
    #[sqlx(flatten)]
    user: UserRow,
    invitation_expires_at: DateTime<Utc>,
}

fn expect_row(affected: u64, user_id: UserId) -> AppResult<()> {
    if affected == 0 {
        return Err(AppError::not_found(format!("Benutzer {user_id} nicht gefunden.")));
    }
    Ok(())
}

#[async_trait]
impl UserDirectory for PgUserRepository {
    async fn find_by_id(&self, id: UserId) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_by_role(&self, role: Role) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE is_active AND $1 = ANY(roles) ORDER BY name"
        ))
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await?;
        debug!(role = %role, count = rows.len(), "Resolved users by role");
        Ok(rows.into_iter().map(User::from).collect())
    }
}

#[async_trait]
impl UserStore for PgUserRepository {
    async fn record_failed_login(&self, user_id: UserId) -> AppResult<u32> {
        let attempts: i32 = sqlx::query_scalar(
            "UPDATE users SET failed_login_attempts = failed_login_attempts + 1, \
             updated_at = NOW() WHERE id = $1 RETURNING failed_login_attempts",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Benutzer {user_id} nicht gefunden.")))?;
        Ok(u32::try_from(attempts).unwrap_or(0))
    }

    async fn reset_failed_logins(&self, user_id: UserId) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, locked_until = NULL, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn lock_account(&self, user_id: UserId, duration_secs: u64) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, \
             locked_until = NOW() + make_interval(secs => $2), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(duration_secs as f64)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn update_password(&self, user_id: UserId, password_hash: String) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn set_totp_secret(&self, user_id: UserId, secret: Option<String>) -> AppResult<()> {
        let result =
            sqlx::query("UPDATE users SET totp_secret = $2, updated_at = NOW() WHERE id = $1")
                .bind(user_id)
                .bind(secret)
                .execute(&self.pool)
                .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn set_email_2fa(&self, user_id: UserId, enabled: bool) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE users SET email_2fa_enabled = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn create_invited(&self, user: NewUser) -> AppResult<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (email, name, roles, is_active, invitation_token_hash, \
             invitation_expires_at) VALUES ($1, $2, $3, FALSE, $4, $5) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user.email.trim())
        .bind(user.name.trim())
        .bind(user.roles.to_names())
        .bind(user.invitation_token_hash)
        .bind(user.invitation_expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => AppError::validation(
                "Für diese E-Mail-Adresse existiert bereits ein Benutzerkonto.",
            ),
            other => AppError::Database(other),
        })?;
        Ok(row.into())
    }

    async fn find_by_invitation(
        &self,
        token_hash: String,
    ) -> AppResult<Option<(User, DateTime<Utc>)>> {
        let row = sqlx::query_as::<_, InvitedUserRow>(&format!(
            "SELECT {USER_COLUMNS}, invitation_expires_at FROM users \
             WHERE invitation_token_hash = $1 AND invitation_expires_at IS NOT NULL"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (User::from(r.user), r.invitation_expires_at)))
    }

    async fn accept_invitation(&self, user_id: UserId, password_hash: String) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, is_active = TRUE, \
             invitation_token_hash = NULL, invitation_expires_at = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn set_roles(&self, user_id: UserId, roles: RoleSet) -> AppResult<()> {
        let result =
            sqlx::query("UPDATE users SET roles = $2, updated_at = NOW() WHERE id = $1")
                .bind(user_id)
                .bind(roles.to_names())
                .execute(&self.pool)
                .await?;
        expect_row(result.rows_affected(), user_id)
    }

    async fn set_active(&self, user_id: UserId, active: bool) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE users SET is_active = $2, \
             deactivated_at = CASE WHEN $2 THEN NULL ELSE NOW() END, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(active)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), user_id)
    }
}
