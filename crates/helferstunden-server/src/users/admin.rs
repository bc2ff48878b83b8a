//! User administration: invitations, roles, (de)activation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::model::{Role, RoleSet, User, UserId};
use super::repository::{NewUser, UserDirectory, UserStore};
use crate::audit::{AuditAction, AuditDiff, AuditRecorder, AuditTable, CreateAuditEntry};
use crate::auth::{
    generate_token, hash_token, seconds, spawn_hash_password, validate_password_policy, Actor,
    SessionRepository,
};
use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::notifications::NotificationGateway;

/// Path of the invitation landing page; the token is appended
pub const INVITATION_PATH: &str = "/einladung";

/// A freshly issued invitation
#[derive(Debug, Clone)]
pub struct Invitation {
    pub user: User,
    pub setup_link: String,
    pub expires_at: DateTime<Utc>,
    /// Set when the invitation mail could not be sent
    pub warning: Option<String>,
}

/// Administrative user operations; all but `accept_invitation` need the
/// administrator role
#[derive(Clone)]
pub struct UserAdmin {
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionRepository>,
    audit: Arc<dyn AuditRecorder>,
    notifier: Arc<dyn NotificationGateway>,
    config: AuthConfig,
    base_url: String,
}

impl UserAdmin {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionRepository>,
        audit: Arc<dyn AuditRecorder>,
        notifier: Arc<dyn NotificationGateway>,
        config: AuthConfig,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            users,
            store,
            sessions,
            audit,
            notifier,
            config,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create an inactive account and send its setup link
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn invite_user(
        &self,
        actor: &Actor,
        email: &str,
        name: &str,
        roles: RoleSet,
    ) -> AppResult<Invitation> {
        self.load_admin(actor).await?;

        let email = email.trim();
        if !is_plausible_email(email) {
            return Err(AppError::validation("Bitte geben Sie eine gültige E-Mail-Adresse an."));
        }
        if name.trim().is_empty() {
            return Err(AppError::validation("Bitte geben Sie einen Namen an."));
        }
        if self.users.find_by_email(email).await?.is_some() {
            return Err(AppError::validation(
                "Für diese E-Mail-Adresse existiert bereits ein Benutzerkonto.",
            ));
        }

        let roles = if roles.is_empty() {
            RoleSet::of(&[Role::Mitglied])
        } else {
            roles
        };
        let token = generate_token();
        let expires_at = Utc::now() + seconds(self.config.invitation_ttl_secs);

        let user = self
            .store
            .create_invited(NewUser {
                email: email.to_string(),
                name: name.trim().to_string(),
                roles,
                invitation_token_hash: hash_token(&token),
                invitation_expires_at: expires_at,
            })
            .await?;

        let diff = AuditDiff::new()
            .set("email", &user.email)
            .set("name", &user.name)
            .set("roles", user.roles);
        self.record(actor, AuditAction::Create, user.id, diff, "Benutzer eingeladen").await?;

        let setup_link = format!("{}{INVITATION_PATH}/{token}", self.base_url);
        let warning = match self.notifier.invitation(&user, &setup_link).await {
            Ok(()) => None,
            Err(err) => {
                warn!(user_id = user.id, error = %err, "Invitation could not be sent");
                Some("Die Einladung konnte nicht per E-Mail versendet werden.".to_string())
            },
        };

        info!(user_id = user.id, "User invited");
        Ok(Invitation {
            user,
            setup_link,
            expires_at,
            warning,
        })
    }

    /// Set the first password through an invitation link and activate the account
    #[instrument(skip_all)]
    pub async fn accept_invitation(&self, token: &str, password: &str) -> AppResult<User> {
        validate_password_policy(password)?;

        let Some((mut user, expires_at)) = self.store.find_by_invitation(hash_token(token)).await?
        else {
            return Err(AppError::validation("Der Einladungslink ist ungültig."));
        };
        if expires_at <= Utc::now() {
            return Err(AppError::validation(
                "Der Einladungslink ist abgelaufen. Bitte fordern Sie eine neue Einladung an.",
            ));
        }

        let hash = spawn_hash_password(password, self.config.bcrypt_cost).await?;
        self.store.accept_invitation(user.id, hash.clone()).await?;
        user.password_hash = Some(hash);
        user.is_active = true;

        let entry = CreateAuditEntry::builder()
            .user_id(Some(user.id))
            .action(AuditAction::Update)
            .table(AuditTable::Users)
            .record_id(Some(user.id))
            .diff(AuditDiff::new().changed("is_active", false, true))
            .description("Einladung angenommen")
            .try_build()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        self.audit.record(entry).await?;

        info!(user_id = user.id, "Invitation accepted");
        Ok(user)
    }

    /// Replace the role set of a user
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn set_roles(&self, actor: &Actor, user_id: UserId, roles: RoleSet) -> AppResult<User> {
        let admin = self.load_admin(actor).await?;
        let mut target = self.load_user(user_id).await?;

        if roles.is_empty() {
            return Err(AppError::validation("Mindestens eine Rolle ist erforderlich."));
        }
        if admin.id == target.id && !roles.is_admin() {
            return Err(AppError::business_rule(
                "Sie können sich die Administratorrolle nicht selbst entziehen.",
            ));
        }
        if roles == target.roles {
            return Ok(target);
        }

        self.store.set_roles(target.id, roles).await?;
        let diff = AuditDiff::new().changed("roles", target.roles, roles);
        self.record(actor, AuditAction::Update, target.id, diff, "Rollen geändert").await?;

        target.roles = roles;
        Ok(target)
    }

    /// Soft-deactivate an account and end all its sessions
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn deactivate_user(&self, actor: &Actor, user_id: UserId) -> AppResult<()> {
        let admin = self.load_admin(actor).await?;
        if admin.id == user_id {
            return Err(AppError::business_rule(
                "Sie können Ihr eigenes Konto nicht deaktivieren.",
            ));
        }
        let target = self.load_user(user_id).await?;
        if !target.is_active {
            return Ok(());
        }

        self.store.set_active(target.id, false).await?;
        let revoked = self.sessions.delete_all_for_user(target.id, None).await?;

        let diff = AuditDiff::new()
            .changed("is_active", true, false)
            .set("sessions_revoked", revoked);
        self.record(actor, AuditAction::Delete, target.id, diff, "Benutzer deaktiviert").await?;

        info!(user_id = target.id, revoked, "User deactivated");
        Ok(())
    }

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn reactivate_user(&self, actor: &Actor, user_id: UserId) -> AppResult<()> {
        self.load_admin(actor).await?;
        let target = self.load_user(user_id).await?;
        if target.is_active {
            return Ok(());
        }
        // invited accounts become active only by accepting the invitation
        if target.password_hash.is_none() {
            return Err(AppError::business_rule(
                "Das Konto hat die Einladung noch nicht angenommen und kann nicht reaktiviert werden.",
            ));
        }

        self.store.set_active(target.id, true).await?;
        let diff = AuditDiff::new().changed("is_active", false, true);
        self.record(actor, AuditAction::Restore, target.id, diff, "Benutzer reaktiviert").await?;

        info!(user_id = target.id, "User reactivated");
        Ok(())
    }

    async fn load_admin(&self, actor: &Actor) -> AppResult<User> {
        match self.users.find_by_id(actor.id()).await? {
            Some(user) if user.is_active && user.roles.is_admin() => Ok(user),
            _ => Err(AppError::authorization(
                "Diese Aktion ist Administratoren vorbehalten.",
            )),
        }
    }

    async fn load_user(&self, user_id: UserId) -> AppResult<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Benutzer {user_id} nicht gefunden.")))
    }

    async fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        record_id: UserId,
        diff: AuditDiff,
        description: &str,
    ) -> AppResult<()> {
        let entry = CreateAuditEntry::builder()
            .user_id(Some(actor.id()))
            .action(action)
            .table(AuditTable::Users)
            .record_id(Some(record_id))
            .diff(diff)
            .description(description)
            .ip_address(actor.ip_address.clone())
            .session_id(actor.session_id.clone())
            .try_build()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        self.audit.record(entry).await
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
                && email.len() <= 254
        },
        None => false,
    }
}
