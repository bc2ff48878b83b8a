//! Audit logging
//!
//! Every authentication attempt and every workflow transition produces one
//! record through an [`AuditRecorder`]. Records carry the acting user, the
//! action, the affected table and record, a typed [`AuditDiff`] of old and
//! new values, a description and the client context (IP, session).
//!
//! # Example
//!
//! ```no_run
//! use helferstunden_server::audit::{
//!     AuditAction, AuditDiff, AuditRecorder, AuditTable, CreateAuditEntry, PgAuditRecorder,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = PgAuditRecorder::new(pool);
//! let entry = CreateAuditEntry::builder()
//!     .action(AuditAction::StatusChange)
//!     .table(AuditTable::WorkEntries)
//!     .record_id(Some(42))
//!     .user_id(Some(7))
//!     .diff(AuditDiff::new().changed("status", "entwurf", "eingereicht"))
//!     .description("Eintrag 2026-00042 eingereicht")
//!     .try_build()?;
//! recorder.record(entry).await?;
//! # Ok(())
//! # }
//! ```

mod models;
mod queries;
mod recorder;

pub use models::{
    AuditAction, AuditDiff, AuditEntry, AuditEntryBuilder, AuditQuery, AuditTable,
    CreateAuditEntry, FieldChange, DEFAULT_AUDIT_QUERY_LIMIT, MAX_AUDIT_QUERY_LIMIT,
};
pub use queries::{create_audit_entry, query_audit_logs};
pub use recorder::{AuditRecorder, PgAuditRecorder};

#[cfg(test)]
pub use recorder::MockAuditRecorder;
