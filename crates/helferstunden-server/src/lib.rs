//! Helferstunden Server Library
//!
//! Work-hour tracking for club members: members record volunteer hours,
//! reviewers approve, reject or return them, administrators manage users.
//!
//! # Overview
//!
//! - **Workflow**: [`workflow::WorkflowEngine`] moves work entries through
//!   `entwurf`, `eingereicht`, `in_klaerung`, `freigegeben`, `abgelehnt` and
//!   `storniert`, enforcing roles, optimistic versions and the ban on
//!   reviewing one's own entries
//! - **Authentication**: [`auth::AuthService`] handles password login with
//!   lockout, server-side sessions with a sliding expiry and TOTP or
//!   emailed second factors
//! - **Audit**: every login attempt and every entry mutation is recorded
//!   through [`audit::AuditRecorder`]
//! - **Notifications**: [`notifications::NotificationGateway`] delivers the
//!   mails a transition calls for; failures never undo the transition
//!
//! # Errors
//!
//! All core operations return [`AppResult`]. [`AppError::kind`] separates
//! authentication, authorization, business-rule, conflict and validation
//! failures so the HTTP layer can map them to distinct responses.
//!
//! # Example
//!
//! ```no_run
//! use helferstunden_server::{config::Config, Services};
//! use sqlx::PgPool;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let pool = PgPool::connect(&config.database.url).await?;
//! let services = Services::postgres(pool, &config);
//! # let _ = services;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod memory;
pub mod middleware;
pub mod notifications;
pub mod users;
pub mod workflow;

use std::sync::Arc;

use sqlx::PgPool;

use crate::audit::PgAuditRecorder;
use crate::auth::{AuthService, PgSessionRepository};
use crate::config::Config;
use crate::notifications::{LoggingNotificationGateway, NotificationGateway};
use crate::users::{PgUserRepository, UserAdmin};
use crate::workflow::{PgWorkflowRepository, WorkflowEngine};

// Re-export commonly used types
pub use error::{AppError, AppResult, ErrorKind};

/// The core services wired against one set of backends
#[derive(Clone)]
pub struct Services {
    pub auth: AuthService,
    pub workflow: WorkflowEngine,
    pub admin: UserAdmin,
}

impl Services {
    /// PostgreSQL storage with notifications written to the log
    pub fn postgres(pool: PgPool, config: &Config) -> Self {
        Self::postgres_with_notifier(pool, config, Arc::new(LoggingNotificationGateway::new()))
    }

    pub fn postgres_with_notifier(
        pool: PgPool,
        config: &Config,
        notifier: Arc<dyn NotificationGateway>,
    ) -> Self {
        let users = Arc::new(PgUserRepository::new(pool.clone()));
        let sessions = Arc::new(PgSessionRepository::new(pool.clone()));
        let entries = Arc::new(PgWorkflowRepository::new(pool.clone()));
        let audit = Arc::new(PgAuditRecorder::new(pool));

        Self {
            auth: AuthService::new(
                users.clone(),
                users.clone(),
                sessions.clone(),
                audit.clone(),
                notifier.clone(),
                config.auth.clone(),
            ),
            workflow: WorkflowEngine::new(
                entries.clone(),
                entries,
                users.clone(),
                audit.clone(),
                notifier.clone(),
            ),
            admin: UserAdmin::new(
                users.clone(),
                users,
                sessions,
                audit,
                notifier,
                config.auth.clone(),
                config.server.base_url.clone(),
            ),
        }
    }
}
