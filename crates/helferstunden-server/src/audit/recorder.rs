//! The audit recording seam used by auth and workflow

use async_trait::async_trait;
use sqlx::PgPool;

use super::models::CreateAuditEntry;
use super::queries::create_audit_entry;
use crate::error::AppResult;

/// Persists immutable action records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, entry: CreateAuditEntry) -> AppResult<()>;
}

/// Writes audit records to the `audit_log` table
#[derive(Clone)]
pub struct PgAuditRecorder {
    pool: PgPool,
}

impl PgAuditRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRecorder for PgAuditRecorder {
    async fn record(&self, entry: CreateAuditEntry) -> AppResult<()> {
        create_audit_entry(&self.pool, entry).await.map(|_| ())
    }
}
