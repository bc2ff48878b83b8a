//! Work entry and dialog persistence

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::debug;

use super::entry::{DialogMessage, NewDialogMessage, NewWorkEntry, WorkEntry};
use super::status::EntryStatus;
use crate::error::{AppError, AppResult};
use crate::users::UserId;

/// Storage for work entries
///
/// Soft-deleted entries are invisible to every method.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkEntryRepository: Send + Sync {
    /// Insert a draft with version 1 and a freshly assigned entry number
    async fn insert(&self, entry: NewWorkEntry) -> AppResult<WorkEntry>;

    async fn find(&self, id: i64) -> AppResult<Option<WorkEntry>>;

    /// Persist `entry` if the stored version still equals `expected_version`
    /// and the stored row was not written after `entry.updated_at`
    ///
    /// Fails with [`AppError::Conflict`] when another writer got there first.
    /// The timestamp guard covers corrections, which keep the version.
    async fn save(&self, entry: WorkEntry, expected_version: i64) -> AppResult<WorkEntry>;
}

/// Storage for clarification threads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DialogRepository: Send + Sync {
    async fn add(&self, message: NewDialogMessage) -> AppResult<DialogMessage>;

    /// Thread of `entry_id`, oldest first
    async fn list(&self, entry_id: i64) -> AppResult<Vec<DialogMessage>>;

    /// Mark unread messages not sent by `reader_id` as read; returns the count
    async fn mark_read(&self, entry_id: i64, reader_id: UserId) -> AppResult<u64>;
}

/// PostgreSQL-backed entry and dialog repository
#[derive(Clone)]
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ENTRY_COLUMNS: &str = "id, entry_number, owner_id, creator_id, work_date, hours, \
     category_id, project, description, status, version, corrected, status_before_cancel, \
     submitted_at, reviewed_by, reviewed_at, rejection_reason, created_at, updated_at, deleted_at";

#[derive(Debug, sqlx::FromRow)]
struct WorkEntryRow {
    id: i64,
    entry_number: String,
    owner_id: i64,
    creator_id: i64,
    work_date: NaiveDate,
    hours: BigDecimal,
    category_id: Option<i64>,
    project: Option<String>,
    description: String,
    status: String,
    version: i64,
    corrected: bool,
    status_before_cancel: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    reviewed_by: Option<i64>,
    reviewed_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

fn parse_status(value: &str) -> AppResult<EntryStatus> {
    value.parse().map_err(AppError::Internal)
}

impl TryFrom<WorkEntryRow> for WorkEntry {
    type Error = AppError;

    fn try_from(row: WorkEntryRow) -> AppResult<Self> {
        Ok(WorkEntry {
            id: row.id,
            entry_number: row.entry_number,
            owner_id: row.owner_id,
            creator_id: row.creator_id,
            work_date: row.work_date,
            hours: row.hours,
            category_id: row.category_id,
            project: row.project,
            description: row.description,
            status: parse_status(&row.status)?,
            version: row.version,
            corrected: row.corrected,
            status_before_cancel: row
                .status_before_cancel
                .as_deref()
                .map(parse_status)
                .transpose()?,
            submitted_at: row.submitted_at,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            rejection_reason: row.rejection_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[async_trait]
impl WorkEntryRepository for PgWorkflowRepository {
    async fn insert(&self, entry: NewWorkEntry) -> AppResult<WorkEntry> {
        let row = sqlx::query_as::<_, WorkEntryRow>(&format!(
            "INSERT INTO work_entries (entry_number, owner_id, creator_id, work_date, hours, \
             category_id, project, description, status, version) \
             VALUES (to_char(NOW(), 'YYYY') || '-' || \
             lpad(nextval('work_entry_number_seq')::text, 5, '0'), \
             $1, $2, $3, $4, $5, $6, $7, $8, 1) \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(entry.owner_id)
        .bind(entry.creator_id)
        .bind(entry.work_date)
        .bind(entry.hours)
        .bind(entry.category_id)
        .bind(entry.project)
        .bind(entry.description)
        .bind(EntryStatus::Entwurf.as_str())
        .fetch_one(&self.pool)
        .await?;

        debug!(entry_number = %row.entry_number, "Inserted work entry");
        row.try_into()
    }

    async fn find(&self, id: i64) -> AppResult<Option<WorkEntry>> {
        sqlx::query_as::<_, WorkEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM work_entries WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(WorkEntry::try_from)
        .transpose()
    }

    async fn save(&self, entry: WorkEntry, expected_version: i64) -> AppResult<WorkEntry> {
        let row = sqlx::query_as::<_, WorkEntryRow>(&format!(
            "UPDATE work_entries SET work_date = $3, hours = $4, category_id = $5, \
             project = $6, description = $7, status = $8, version = $9, corrected = $10, \
             status_before_cancel = $11, submitted_at = $12, reviewed_by = $13, \
             reviewed_at = $14, rejection_reason = $15, deleted_at = $16, updated_at = NOW() \
             WHERE id = $1 AND version = $2 AND updated_at = $17 AND deleted_at IS NULL \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(entry.id)
        .bind(expected_version)
        .bind(entry.work_date)
        .bind(entry.hours)
        .bind(entry.category_id)
        .bind(entry.project)
        .bind(entry.description)
        .bind(entry.status.as_str())
        .bind(entry.version)
        .bind(entry.corrected)
        .bind(entry.status_before_cancel.map(EntryStatus::as_str))
        .bind(entry.submitted_at)
        .bind(entry.reviewed_by)
        .bind(entry.reviewed_at)
        .bind(entry.rejection_reason)
        .bind(entry.deleted_at)
        .bind(entry.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                debug!(entry_id = entry.id, expected_version, "Version check failed on save");
                Err(AppError::stale_version())
            },
        }
    }
}

#[async_trait]
impl DialogRepository for PgWorkflowRepository {
    async fn add(&self, message: NewDialogMessage) -> AppResult<DialogMessage> {
        let row = sqlx::query_as::<_, DialogMessage>(
            "INSERT INTO dialog_messages (entry_id, sender_id, body) VALUES ($1, $2, $3) \
             RETURNING id, entry_id, sender_id, body, is_read, created_at, read_at",
        )
        .bind(message.entry_id)
        .bind(message.sender_id)
        .bind(message.body)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list(&self, entry_id: i64) -> AppResult<Vec<DialogMessage>> {
        let rows = sqlx::query_as::<_, DialogMessage>(
            "SELECT id, entry_id, sender_id, body, is_read, created_at, read_at \
             FROM dialog_messages WHERE entry_id = $1 ORDER BY created_at, id",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_read(&self, entry_id: i64, reader_id: UserId) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE dialog_messages SET is_read = TRUE, read_at = NOW() \
             WHERE entry_id = $1 AND sender_id <> $2 AND NOT is_read",
        )
        .bind(entry_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
