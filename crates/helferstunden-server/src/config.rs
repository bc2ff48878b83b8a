//! Configuration management

use helferstunden_common::CommonError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/helferstunden";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Authentication Constants
// ============================================================================

/// Consecutive failed logins before the account is locked.
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;

/// How long a locked account stays locked, in seconds.
pub const DEFAULT_LOCKOUT_DURATION_SECS: u64 = 900;

/// Sliding session lifetime in seconds.
pub const DEFAULT_SESSION_LIFETIME_SECS: u64 = 1800;

/// bcrypt work factor for password hashes.
pub const DEFAULT_BCRYPT_COST: u32 = 12;

/// Validity of an emailed second-factor code, in seconds.
pub const DEFAULT_EMAIL_CODE_TTL_SECS: u64 = 600;

/// Validity of an invitation link, in seconds (7 days).
pub const DEFAULT_INVITATION_TTL_SECS: u64 = 7 * 24 * 3600;

/// Base URL used when building links in notifications.
pub const DEFAULT_APP_BASE_URL: &str = "http://localhost:8080";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Authentication and session policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub max_login_attempts: u32,
    pub lockout_duration_secs: u64,
    pub session_lifetime_secs: u64,
    pub bcrypt_cost: u32,
    /// Users without a second factor are sent to the setup page
    pub require_two_factor: bool,
    pub email_code_ttl_secs: u64,
    pub invitation_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            lockout_duration_secs: DEFAULT_LOCKOUT_DURATION_SECS,
            session_lifetime_secs: DEFAULT_SESSION_LIFETIME_SECS,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            require_two_factor: false,
            email_code_ttl_secs: DEFAULT_EMAIL_CODE_TTL_SECS,
            invitation_ttl_secs: DEFAULT_INVITATION_TTL_SECS,
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset.
///
/// A set but unparsable value is an error rather than a silent fallback.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, CommonError> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| CommonError::InvalidEnv {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, CommonError> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: env_or("HELFERSTUNDEN_HOST", DEFAULT_SERVER_HOST.to_string())?,
                port: env_or("HELFERSTUNDEN_PORT", DEFAULT_SERVER_PORT)?,
                shutdown_timeout_secs: env_or(
                    "HELFERSTUNDEN_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                )?,
                base_url: env_or("APP_BASE_URL", DEFAULT_APP_BASE_URL.to_string())?,
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL.to_string())?,
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                )?,
            },
            auth: AuthConfig {
                max_login_attempts: env_or("AUTH_MAX_LOGIN_ATTEMPTS", DEFAULT_MAX_LOGIN_ATTEMPTS)?,
                lockout_duration_secs: env_or(
                    "AUTH_LOCKOUT_DURATION",
                    DEFAULT_LOCKOUT_DURATION_SECS,
                )?,
                session_lifetime_secs: env_or(
                    "AUTH_SESSION_LIFETIME",
                    DEFAULT_SESSION_LIFETIME_SECS,
                )?,
                bcrypt_cost: env_or("AUTH_BCRYPT_COST", DEFAULT_BCRYPT_COST)?,
                require_two_factor: env_or("AUTH_REQUIRE_2FA", false)?,
                email_code_ttl_secs: env_or("AUTH_EMAIL_CODE_TTL", DEFAULT_EMAIL_CODE_TTL_SECS)?,
                invitation_ttl_secs: env_or("AUTH_INVITATION_TTL", DEFAULT_INVITATION_TTL_SECS)?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.server.port == 0 {
            return Err(CommonError::config("Server port must be greater than 0"));
        }

        if self.database.url.is_empty() {
            return Err(CommonError::config("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(CommonError::config("Database max_connections must be greater than 0"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(CommonError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        self.auth.validate()
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.max_login_attempts == 0 {
            return Err(CommonError::config("AUTH_MAX_LOGIN_ATTEMPTS must be greater than 0"));
        }
        if self.lockout_duration_secs == 0 {
            return Err(CommonError::config("AUTH_LOCKOUT_DURATION must be greater than 0"));
        }
        if self.session_lifetime_secs == 0 {
            return Err(CommonError::config("AUTH_SESSION_LIFETIME must be greater than 0"));
        }
        // bcrypt only accepts work factors in this range
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(CommonError::config(format!(
                "AUTH_BCRYPT_COST must be between 4 and 31, got {}",
                self.bcrypt_cost
            )));
        }
        if self.require_two_factor && self.email_code_ttl_secs == 0 {
            tracing::warn!("2FA is required but emailed codes expire immediately");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                base_url: DEFAULT_APP_BASE_URL.to_string(),
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            auth: AuthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_policy() {
        let config = Config::default();
        assert_eq!(config.auth.max_login_attempts, 5);
        assert_eq!(config.auth.lockout_duration_secs, 900);
        assert_eq!(config.auth.session_lifetime_secs, 1800);
        assert_eq!(config.auth.bcrypt_cost, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_bcrypt_cost() {
        let mut config = Config::default();
        config.auth.bcrypt_cost = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_lockout_policy() {
        std::env::set_var("AUTH_MAX_LOGIN_ATTEMPTS", "3");
        std::env::set_var("AUTH_LOCKOUT_DURATION", "60");
        let config = Config::load();
        std::env::remove_var("AUTH_MAX_LOGIN_ATTEMPTS");
        std::env::remove_var("AUTH_LOCKOUT_DURATION");

        let config = config.unwrap();
        assert_eq!(config.auth.max_login_attempts, 3);
        assert_eq!(config.auth.lockout_duration_secs, 60);
    }

    #[test]
    #[serial]
    fn test_unparsable_env_value_is_an_error() {
        std::env::set_var("AUTH_SESSION_LIFETIME", "half an hour");
        let result = Config::load();
        std::env::remove_var("AUTH_SESSION_LIFETIME");

        assert!(matches!(result, Err(CommonError::InvalidEnv { .. })));
    }
}
