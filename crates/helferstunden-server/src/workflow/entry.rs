//! Work entries and their clarification dialog

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::status::EntryStatus;
use crate::error::{AppError, AppResult};
use crate::users::UserId;

/// Upper bound for the hours of a single entry
pub const MAX_HOURS_PER_ENTRY: i32 = 24;

/// A volunteer-hour claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEntry {
    pub id: i64,
    /// Human-readable number (`YYYY-NNNNN`), fixed once assigned
    pub entry_number: String,
    pub owner_id: UserId,
    pub creator_id: UserId,
    pub work_date: NaiveDate,
    pub hours: BigDecimal,
    pub category_id: Option<i64>,
    pub project: Option<String>,
    pub description: String,
    pub status: EntryStatus,
    pub version: i64,
    pub corrected: bool,
    /// State the entry was in when it was cancelled
    pub status_before_cancel: Option<EntryStatus>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorkEntry {
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }

    pub fn is_created_by(&self, user_id: UserId) -> bool {
        self.creator_id == user_id
    }

    /// Owner or creator; the parties entitled to the owner-side operations
    pub fn is_party(&self, user_id: UserId) -> bool {
        self.is_owned_by(user_id) || self.is_created_by(user_id)
    }
}

/// Caller input for a new entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntryInput {
    /// Member the hours are credited to; defaults to the acting user
    pub owner_id: Option<UserId>,
    pub work_date: NaiveDate,
    pub hours: BigDecimal,
    pub category_id: Option<i64>,
    pub project: Option<String>,
    pub description: String,
}

/// Row data handed to the repository on insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkEntry {
    pub owner_id: UserId,
    pub creator_id: UserId,
    pub work_date: NaiveDate,
    pub hours: BigDecimal,
    pub category_id: Option<i64>,
    pub project: Option<String>,
    pub description: String,
}

/// Edits to a draft; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DraftChanges {
    pub work_date: Option<NaiveDate>,
    pub hours: Option<BigDecimal>,
    pub category_id: Option<Option<i64>>,
    pub project: Option<Option<String>>,
    pub description: Option<String>,
}

impl DraftChanges {
    pub fn is_empty(&self) -> bool {
        self.work_date.is_none()
            && self.hours.is_none()
            && self.category_id.is_none()
            && self.project.is_none()
            && self.description.is_none()
    }
}

/// In-place correction of an approved entry
///
/// Corrections keep the version, so `read_at` (the `updated_at` the caller
/// read) is what detects a concurrent correction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Correction {
    pub hours: Option<BigDecimal>,
    pub description: Option<String>,
    pub reason: String,
    pub read_at: DateTime<Utc>,
}

pub(crate) fn validate_hours(hours: &BigDecimal) -> AppResult<()> {
    if *hours <= BigDecimal::from(0) {
        return Err(AppError::validation("Die Stundenzahl muss größer als 0 sein."));
    }
    if *hours > BigDecimal::from(MAX_HOURS_PER_ENTRY) {
        return Err(AppError::validation(format!(
            "Ein Eintrag darf höchstens {MAX_HOURS_PER_ENTRY} Stunden umfassen."
        )));
    }
    Ok(())
}

pub(crate) fn validate_description(description: &str) -> AppResult<()> {
    if description.trim().is_empty() {
        return Err(AppError::validation("Bitte beschreiben Sie die geleistete Tätigkeit."));
    }
    Ok(())
}

/// One message in an entry's clarification thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DialogMessage {
    pub id: i64,
    pub entry_id: i64,
    pub sender_id: UserId,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDialogMessage {
    pub entry_id: i64,
    pub sender_id: UserId,
    pub body: String,
}
