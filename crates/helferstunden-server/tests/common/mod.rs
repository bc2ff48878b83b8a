//! Shared fixtures: services wired against the in-memory backends

#![allow(dead_code)]

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, Utc};

use helferstunden_server::auth::{hash_password, Actor, AuthService};
use helferstunden_server::config::AuthConfig;
use helferstunden_server::memory::{
    MemoryAuditRecorder, MemorySessionRepository, MemoryUserRepository,
    MemoryWorkflowRepository, RecordingNotificationGateway,
};
use helferstunden_server::users::{Role, RoleSet, User, UserAdmin, UserId};
use helferstunden_server::workflow::{EntryInput, WorkflowEngine};

pub const PASSWORD: &str = "Sommerfest2026!";
pub const BASE_URL: &str = "https://helfer.verein.example";

pub struct Harness {
    pub users: Arc<MemoryUserRepository>,
    pub sessions: Arc<MemorySessionRepository>,
    pub entries: Arc<MemoryWorkflowRepository>,
    pub audit: Arc<MemoryAuditRecorder>,
    pub notifier: Arc<RecordingNotificationGateway>,
    pub config: AuthConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            users: Arc::new(MemoryUserRepository::new()),
            sessions: Arc::new(MemorySessionRepository::new()),
            entries: Arc::new(MemoryWorkflowRepository::new()),
            audit: Arc::new(MemoryAuditRecorder::new()),
            notifier: Arc::new(RecordingNotificationGateway::new()),
            config: AuthConfig {
                // bcrypt's minimum cost keeps the suite fast
                bcrypt_cost: 4,
                ..AuthConfig::default()
            },
        }
    }

    pub fn engine(&self) -> WorkflowEngine {
        WorkflowEngine::new(
            self.entries.clone(),
            self.entries.clone(),
            self.users.clone(),
            self.audit.clone(),
            self.notifier.clone(),
        )
    }

    pub fn auth(&self) -> AuthService {
        AuthService::new(
            self.users.clone(),
            self.users.clone(),
            self.sessions.clone(),
            self.audit.clone(),
            self.notifier.clone(),
            self.config.clone(),
        )
    }

    pub fn admin(&self) -> UserAdmin {
        UserAdmin::new(
            self.users.clone(),
            self.users.clone(),
            self.sessions.clone(),
            self.audit.clone(),
            self.notifier.clone(),
            self.config.clone(),
            BASE_URL,
        )
    }

    /// Active user without a password
    pub fn add_user(&self, id: UserId, roles: &[Role]) -> User {
        let user = User {
            id,
            email: format!("user{id}@verein.example"),
            name: format!("Mitglied {id}"),
            is_active: true,
            roles: RoleSet::of(roles),
            password_hash: None,
            totp_secret: None,
            email_2fa_enabled: false,
            failed_login_attempts: 0,
            locked_until: None,
            created_at: Utc::now(),
        };
        self.users.insert(user.clone());
        user
    }

    /// Active user who logs in with [`PASSWORD`]
    pub fn add_user_with_password(&self, id: UserId, roles: &[Role]) -> User {
        let mut user = self.add_user(id, roles);
        user.password_hash = Some(hash_password(PASSWORD, self.config.bcrypt_cost).unwrap());
        self.users.insert(user.clone());
        user
    }

    pub fn actor(&self, id: UserId) -> Actor {
        Actor::new(self.users.get(id).expect("user exists"))
    }
}

pub fn entry_input(hours: i64) -> EntryInput {
    EntryInput {
        owner_id: None,
        work_date: NaiveDate::from_ymd_opt(2026, 6, 13).unwrap(),
        hours: BigDecimal::from(hours),
        category_id: None,
        project: Some("Sommerfest".to_string()),
        description: "Zeltaufbau am Sportplatz".to_string(),
    }
}
