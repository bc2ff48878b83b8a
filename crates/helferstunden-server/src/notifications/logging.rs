//! Gateway that writes notifications to the log instead of sending mail
//!
//! Used in development and as the default until a mail relay is configured.

use async_trait::async_trait;
use tracing::info;

use super::{NotificationError, NotificationGateway, NotificationKind};
use crate::users::User;
use crate::workflow::WorkEntry;

#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationGateway;

impl LoggingNotificationGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationGateway for LoggingNotificationGateway {
    async fn entry_submitted(
        &self,
        entry: &WorkEntry,
        reviewers: &[User],
    ) -> Result<(), NotificationError> {
        for reviewer in reviewers {
            info!(
                kind = %NotificationKind::EntrySubmitted,
                to = %reviewer.email,
                entry = %entry.entry_number,
                "Notification"
            );
        }
        Ok(())
    }

    async fn entry_approved(
        &self,
        entry: &WorkEntry,
        owner: &User,
    ) -> Result<(), NotificationError> {
        info!(
            kind = %NotificationKind::EntryApproved,
            to = %owner.email,
            entry = %entry.entry_number,
            "Notification"
        );
        Ok(())
    }

    async fn entry_rejected(
        &self,
        entry: &WorkEntry,
        owner: &User,
        reason: &str,
    ) -> Result<(), NotificationError> {
        info!(
            kind = %NotificationKind::EntryRejected,
            to = %owner.email,
            entry = %entry.entry_number,
            reason,
            "Notification"
        );
        Ok(())
    }

    async fn entry_returned(
        &self,
        entry: &WorkEntry,
        owner: &User,
        reason: &str,
    ) -> Result<(), NotificationError> {
        info!(
            kind = %NotificationKind::EntryReturned,
            to = %owner.email,
            entry = %entry.entry_number,
            reason,
            "Notification"
        );
        Ok(())
    }

    async fn invitation(&self, user: &User, setup_link: &str) -> Result<(), NotificationError> {
        info!(
            kind = %NotificationKind::Invitation,
            to = %user.email,
            setup_link,
            "Notification"
        );
        Ok(())
    }

    async fn two_factor_code(&self, user: &User, _code: &str) -> Result<(), NotificationError> {
        // The code itself stays out of the log.
        info!(kind = %NotificationKind::TwoFactorCode, to = %user.email, "Notification");
        Ok(())
    }
}
