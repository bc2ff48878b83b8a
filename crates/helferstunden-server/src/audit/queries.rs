//! Database queries for the audit log

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use super::models::{AuditEntry, AuditQuery, CreateAuditEntry, MAX_AUDIT_QUERY_LIMIT};
use crate::error::AppResult;

const AUDIT_COLUMNS: &str = "id, user_id, action, table_name, record_id, old_values, new_values, \
     description, ip_address, session_id, created_at";

/// Insert a new audit record
///
/// Audit rows are append-only; nothing in the crate updates or deletes them.
pub async fn create_audit_entry(pool: &PgPool, entry: CreateAuditEntry) -> AppResult<AuditEntry> {
    let record = sqlx::query_as::<_, AuditEntry>(&format!(
        r#"
        INSERT INTO audit_log (
            user_id, action, table_name, record_id, old_values, new_values,
            description, ip_address, session_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {AUDIT_COLUMNS}
        "#
    ))
    .bind(entry.user_id)
    .bind(entry.action.as_str())
    .bind(entry.table.as_str())
    .bind(entry.record_id)
    .bind(entry.diff.old_values())
    .bind(entry.diff.new_values())
    .bind(&entry.description)
    .bind(&entry.ip_address)
    .bind(&entry.session_id)
    .fetch_one(pool)
    .await?;

    debug!(
        audit_id = record.id,
        action = %entry.action,
        table = %entry.table,
        "Created audit log entry"
    );

    Ok(record)
}

/// Query audit logs with filters, newest first
pub async fn query_audit_logs(pool: &PgPool, query: AuditQuery) -> AppResult<Vec<AuditEntry>> {
    let limit = query.limit.clamp(1, MAX_AUDIT_QUERY_LIMIT);
    let offset = query.offset.max(0);

    let mut sql: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE TRUE"));

    if let Some(user_id) = query.user_id {
        sql.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(action) = query.action {
        sql.push(" AND action = ").push_bind(action.as_str());
    }
    if let Some(table) = query.table {
        sql.push(" AND table_name = ").push_bind(table.as_str());
    }
    if let Some(record_id) = query.record_id {
        sql.push(" AND record_id = ").push_bind(record_id);
    }
    if let Some(start_time) = query.start_time {
        sql.push(" AND created_at >= ").push_bind(start_time);
    }
    if let Some(end_time) = query.end_time {
        sql.push(" AND created_at <= ").push_bind(end_time);
    }

    sql.push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let records = sql.build_query_as::<AuditEntry>().fetch_all(pool).await?;

    debug!(count = records.len(), "Queried audit logs");

    Ok(records)
}
