//! Transactional notifications
//!
//! The workflow and auth core only decide *that* a notification is due; how
//! it is rendered and delivered belongs to the [`NotificationGateway`]
//! implementation. Delivery failures are reported as [`NotificationError`]
//! and never undo the state change that triggered them.

use async_trait::async_trait;
use thiserror::Error;

use crate::users::User;
use crate::workflow::WorkEntry;

mod logging;

pub use logging::LoggingNotificationGateway;

/// Delivery failure of a single notification
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Mail relay unavailable: {0}")]
    Unavailable(String),

    #[error("Recipient rejected: {0}")]
    Rejected(String),
}

/// Notification events, used for logging and warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    EntrySubmitted,
    EntryApproved,
    EntryRejected,
    EntryReturned,
    Invitation,
    TwoFactorCode,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::EntrySubmitted => "entry_submitted",
            NotificationKind::EntryApproved => "entry_approved",
            NotificationKind::EntryRejected => "entry_rejected",
            NotificationKind::EntryReturned => "entry_returned",
            NotificationKind::Invitation => "invitation",
            NotificationKind::TwoFactorCode => "two_factor_code",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends transactional notifications, one method per event
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// A member submitted an entry; goes to every reviewer
    async fn entry_submitted(
        &self,
        entry: &WorkEntry,
        reviewers: &[User],
    ) -> Result<(), NotificationError>;

    async fn entry_approved(&self, entry: &WorkEntry, owner: &User)
        -> Result<(), NotificationError>;

    async fn entry_rejected(
        &self,
        entry: &WorkEntry,
        owner: &User,
        reason: &str,
    ) -> Result<(), NotificationError>;

    /// The entry went back to the owner with a clarification question
    async fn entry_returned(
        &self,
        entry: &WorkEntry,
        owner: &User,
        reason: &str,
    ) -> Result<(), NotificationError>;

    async fn invitation(&self, user: &User, setup_link: &str) -> Result<(), NotificationError>;

    /// One-time login code for users with email-based 2FA
    async fn two_factor_code(&self, user: &User, code: &str) -> Result<(), NotificationError>;
}
