//! Infrastructure error types

use thiserror::Error;

/// Result type alias for infrastructure operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while bootstrapping a process (configuration, logging, IO)
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

impl CommonError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_env_message() {
        let err = CommonError::InvalidEnv {
            key: "AUTH_BCRYPT_COST".to_string(),
            value: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid value for AUTH_BCRYPT_COST: abc");
    }
}
