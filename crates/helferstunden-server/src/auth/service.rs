//! Login, lockout, sessions and second-factor verification

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::password::{spawn_hash_password, spawn_verify_password, validate_password_policy};
use super::session::{generate_token, session_reference, Session, SessionContext, SessionRepository};
use super::two_factor::{
    generate_email_code, hash_code, verify_email_code, verify_totp, PendingTwoFactor,
    TwoFactorMethod,
};
use super::{seconds, Actor};
use crate::audit::{
    AuditAction, AuditDiff, AuditEntryBuilder, AuditRecorder, AuditTable, CreateAuditEntry,
};
use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::notifications::NotificationGateway;
use crate::users::{User, UserDirectory, UserId, UserStore};

const INVALID_CREDENTIALS: &str = "E-Mail-Adresse oder Passwort ist falsch.";

const ACCOUNT_LOCKED: &str = "Ihr Konto ist wegen zu vieler fehlgeschlagener Anmeldeversuche \
     vorübergehend gesperrt. Bitte versuchen Sie es später erneut.";

const NO_PENDING_LOGIN: &str = "Es ist keine Anmeldung ausstehend. Bitte melden Sie sich erneut an.";

/// Result of a password login
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// A session was opened
    Authenticated(User),
    /// The login is parked until the second factor is verified
    SecondFactorRequired(TwoFactorMethod),
}

/// Authentication core
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionRepository>,
    audit: Arc<dyn AuditRecorder>,
    notifier: Arc<dyn NotificationGateway>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionRepository>,
        audit: Arc<dyn AuditRecorder>,
        notifier: Arc<dyn NotificationGateway>,
        config: AuthConfig,
    ) -> Self {
        Self {
            users,
            store,
            sessions,
            audit,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Verify email and password, counting failures towards the lockout
    ///
    /// A locked account fails before the password is looked at. The attempt
    /// that reaches the limit locks the account and gets the lockout message
    /// instead of a remaining-attempts count.
    #[instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        client_ip: Option<&str>,
    ) -> AppResult<User> {
        let ip = client_ip.map(str::to_string);

        let Some(mut user) = self.users.find_by_email(email).await? else {
            self.audit_login_failure(None, email, "user not found", ip).await?;
            return Err(AppError::authentication(INVALID_CREDENTIALS));
        };

        if !user.is_active {
            self.audit_login_failure(Some(user.id), email, "user inactive", ip).await?;
            return Err(AppError::authentication(INVALID_CREDENTIALS));
        }

        if user.is_locked_at(Utc::now()) {
            self.audit_login_failure(Some(user.id), email, "account locked", ip).await?;
            return Err(AppError::authentication(ACCOUNT_LOCKED));
        }

        let valid = match user.password_hash.clone() {
            Some(hash) => spawn_verify_password(password, hash).await?,
            None => false,
        };

        if !valid {
            let attempts = self.store.record_failed_login(user.id).await?;
            let limit = self.config.max_login_attempts;

            if attempts >= limit {
                self.store
                    .lock_account(user.id, self.config.lockout_duration_secs)
                    .await?;
                warn!(user_id = user.id, attempts, "Account locked after repeated failed logins");
                self.audit_login_failure(
                    Some(user.id),
                    email,
                    &format!("invalid password, account locked after {attempts} attempts"),
                    ip,
                )
                .await?;
                return Err(AppError::authentication(ACCOUNT_LOCKED));
            }

            let remaining = limit - attempts;
            self.audit_login_failure(
                Some(user.id),
                email,
                &format!("invalid password (attempt {attempts} of {limit})"),
                ip,
            )
            .await?;
            return Err(AppError::authentication(format!(
                "{INVALID_CREDENTIALS} Verbleibende Versuche bis zur Sperrung: {remaining}."
            )));
        }

        self.store.reset_failed_logins(user.id).await?;
        user.failed_login_attempts = 0;
        user.locked_until = None;

        self.record(
            CreateAuditEntry::builder()
                .user_id(Some(user.id))
                .action(AuditAction::Login)
                .table(AuditTable::Users)
                .record_id(Some(user.id))
                .diff(AuditDiff::new().set("email", &user.email))
                .description("Passwort erfolgreich geprüft")
                .ip_address(ip),
        )
        .await?;

        info!(user_id = user.id, "Password accepted");
        Ok(user)
    }

    /// Password login; opens a session or parks the login for the second factor
    #[instrument(skip(self, ctx, password))]
    pub async fn login(
        &self,
        ctx: &mut SessionContext,
        email: &str,
        password: &str,
    ) -> AppResult<LoginOutcome> {
        self.clear_pending_2fa(ctx);
        let user = self
            .authenticate(email, password, ctx.ip_address.as_deref())
            .await?;

        if TwoFactorMethod::for_user(&user).is_some() {
            let method = self.set_pending_2fa(ctx, &user).await?;
            return Ok(LoginOutcome::SecondFactorRequired(method));
        }

        self.open_session(ctx, &user).await?;
        Ok(LoginOutcome::Authenticated(user))
    }

    /// Park `user` until the second factor is verified
    ///
    /// For email codes the code is generated and sent here; only its hash is
    /// kept in the context.
    pub async fn set_pending_2fa(
        &self,
        ctx: &mut SessionContext,
        user: &User,
    ) -> AppResult<TwoFactorMethod> {
        let method = TwoFactorMethod::for_user(user).ok_or_else(|| {
            AppError::validation(
                "Für dieses Konto ist keine Zwei-Faktor-Authentifizierung eingerichtet.",
            )
        })?;

        let mut pending = PendingTwoFactor::new(user.id, method, self.config.email_code_ttl_secs);
        if method == TwoFactorMethod::EmailCode {
            let code = generate_email_code();
            if let Err(err) = self.notifier.two_factor_code(user, &code).await {
                warn!(user_id = user.id, error = %err, "Login code could not be sent");
                return Err(AppError::Internal(format!("Login code delivery failed: {err}")));
            }
            pending = pending.with_code_hash(hash_code(&code));
        }

        ctx.pending_2fa = Some(pending);
        debug!(user_id = user.id, method = method.as_str(), "Second factor pending");
        Ok(method)
    }

    /// Pending second-factor state, if any and not yet expired
    pub fn get_pending_2fa(&self, ctx: &SessionContext) -> Option<PendingTwoFactor> {
        ctx.pending_2fa
            .clone()
            .filter(|pending| !pending.is_expired_at(Utc::now()))
    }

    pub fn clear_pending_2fa(&self, ctx: &mut SessionContext) {
        ctx.pending_2fa = None;
    }

    /// Complete a parked login with a TOTP or emailed code
    #[instrument(skip(self, ctx, code))]
    pub async fn verify_second_factor(
        &self,
        ctx: &mut SessionContext,
        code: &str,
    ) -> AppResult<User> {
        let Some(mut pending) = ctx.pending_2fa.take() else {
            return Err(AppError::authentication(NO_PENDING_LOGIN));
        };
        let ip = ctx.ip_address.clone();
        let now = Utc::now();

        let user = match self.users.find_by_id(pending.user_id).await? {
            Some(user) if user.is_active && !user.is_locked_at(now) => user,
            _ => {
                self.audit_login_failure(Some(pending.user_id), "", "user unavailable", ip)
                    .await?;
                return Err(AppError::authentication(INVALID_CREDENTIALS));
            },
        };

        if pending.is_expired_at(now) {
            self.audit_login_failure(Some(user.id), &user.email, "second factor expired", ip)
                .await?;
            return Err(AppError::authentication(
                "Der Bestätigungscode ist abgelaufen. Bitte melden Sie sich erneut an.",
            ));
        }

        let valid = match pending.method {
            TwoFactorMethod::Totp => match user.totp_secret.as_deref() {
                Some(secret) => verify_totp(secret, code)?,
                None => false,
            },
            TwoFactorMethod::EmailCode => pending
                .code_hash
                .as_deref()
                .is_some_and(|hash| verify_email_code(code, hash)),
        };

        if !valid {
            pending.failed_attempts += 1;
            let exhausted = pending.failed_attempts >= self.config.max_login_attempts;
            self.audit_login_failure(
                Some(user.id),
                &user.email,
                &format!("invalid {} code", pending.method.as_str()),
                ip,
            )
            .await?;
            if exhausted {
                warn!(user_id = user.id, "Second factor attempts exhausted");
                return Err(AppError::authentication(
                    "Zu viele ungültige Codes. Bitte melden Sie sich erneut an.",
                ));
            }
            ctx.pending_2fa = Some(pending);
            return Err(AppError::authentication("Der eingegebene Code ist ungültig."));
        }

        self.open_session(ctx, &user).await?;
        self.record(
            CreateAuditEntry::builder()
                .user_id(Some(user.id))
                .action(AuditAction::Login)
                .table(AuditTable::Users)
                .record_id(Some(user.id))
                .diff(AuditDiff::new().set("method", pending.method))
                .description("Zwei-Faktor-Anmeldung erfolgreich")
                .ip_address(ip)
                .session_id(ctx.session_reference()),
        )
        .await?;

        info!(user_id = user.id, method = pending.method.as_str(), "Second factor accepted");
        Ok(user)
    }

    /// End the client's session
    #[instrument(skip_all)]
    pub async fn logout(&self, ctx: &mut SessionContext) -> AppResult<()> {
        ctx.pending_2fa = None;
        let Some(token) = ctx.token.take() else {
            return Ok(());
        };

        let session = self.sessions.find(token.clone()).await?;
        self.sessions.delete(token.clone()).await?;

        if let Some(session) = session {
            self.record(
                CreateAuditEntry::builder()
                    .user_id(Some(session.user_id))
                    .action(AuditAction::Logout)
                    .table(AuditTable::Sessions)
                    .record_id(Some(session.user_id))
                    .description("Abmeldung")
                    .ip_address(ctx.ip_address.clone())
                    .session_id(Some(session_reference(&token))),
            )
            .await?;
            info!(user_id = session.user_id, "Logged out");
        }
        Ok(())
    }

    /// Set a new password and revoke every other session of the user
    ///
    /// The session in `ctx` survives so the user stays logged in on the
    /// device that made the change. Returns the number of revoked sessions.
    #[instrument(skip(self, ctx, new_password))]
    pub async fn change_password(
        &self,
        ctx: &SessionContext,
        user_id: UserId,
        new_password: &str,
    ) -> AppResult<u64> {
        validate_password_policy(new_password)?;

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Benutzer {user_id} nicht gefunden.")))?;

        let hash = spawn_hash_password(new_password, self.config.bcrypt_cost).await?;
        self.store.update_password(user.id, hash).await?;

        let revoked = self
            .sessions
            .delete_all_for_user(user.id, ctx.token().map(str::to_string))
            .await?;

        self.record(
            CreateAuditEntry::builder()
                .user_id(Some(user.id))
                .action(AuditAction::Update)
                .table(AuditTable::Users)
                .record_id(Some(user.id))
                .diff(AuditDiff::new().set("sessions_revoked", revoked))
                .description("Passwort geändert")
                .ip_address(ctx.ip_address.clone())
                .session_id(ctx.session_reference()),
        )
        .await?;

        info!(user_id = user.id, revoked, "Password changed");
        Ok(revoked)
    }

    /// User behind the context's session, extending the session on success
    ///
    /// Expired sessions and sessions of deactivated users are removed on the
    /// spot. Storage errors are logged and read as "not logged in".
    pub async fn current_user(&self, ctx: &mut SessionContext) -> Option<User> {
        let token = ctx.token.clone()?;

        let session = match self.sessions.find(token.clone()).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                ctx.token = None;
                return None;
            },
            Err(err) => {
                warn!(error = %err, "Session lookup failed");
                return None;
            },
        };

        let now = Utc::now();
        if session.is_expired_at(now) {
            debug!(user_id = session.user_id, "Session expired");
            self.discard_session(ctx, token).await;
            return None;
        }

        let user = match self.users.find_by_id(session.user_id).await {
            Ok(Some(user)) if user.is_active => user,
            Ok(_) => {
                self.discard_session(ctx, token).await;
                return None;
            },
            Err(err) => {
                warn!(error = %err, "User lookup for session failed");
                return None;
            },
        };

        let expires_at = now + seconds(self.config.session_lifetime_secs);
        if let Err(err) = self.sessions.touch(token, expires_at).await {
            warn!(error = %err, "Could not extend session");
        }
        Some(user)
    }

    pub async fn is_authenticated(&self, ctx: &mut SessionContext) -> bool {
        self.current_user(ctx).await.is_some()
    }

    /// Actor for workflow calls made through this context
    pub async fn actor(&self, ctx: &mut SessionContext) -> Option<Actor> {
        let user = self.current_user(ctx).await?;
        let mut actor = Actor::new(user);
        actor.ip_address = ctx.ip_address.clone();
        actor.session_id = ctx.session_reference();
        Some(actor)
    }

    /// Confirm an authenticator app by checking one code, then store its secret
    #[instrument(skip(self, secret, code))]
    pub async fn enable_totp(&self, user_id: UserId, secret: &str, code: &str) -> AppResult<()> {
        if !verify_totp(secret, code)? {
            return Err(AppError::validation(
                "Der Code aus der Authenticator-App ist ungültig.",
            ));
        }
        self.store
            .set_totp_secret(user_id, Some(secret.to_string()))
            .await?;
        self.record(
            CreateAuditEntry::builder()
                .user_id(Some(user_id))
                .action(AuditAction::Update)
                .table(AuditTable::Users)
                .record_id(Some(user_id))
                .diff(AuditDiff::new().changed("totp_enabled", false, true))
                .description("Authenticator-App eingerichtet"),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn enable_email_2fa(&self, user_id: UserId) -> AppResult<()> {
        self.store.set_email_2fa(user_id, true).await?;
        self.record(
            CreateAuditEntry::builder()
                .user_id(Some(user_id))
                .action(AuditAction::Update)
                .table(AuditTable::Users)
                .record_id(Some(user_id))
                .diff(AuditDiff::new().changed("email_2fa_enabled", false, true))
                .description("Zwei-Faktor-Anmeldung per E-Mail aktiviert"),
        )
        .await
    }

    async fn open_session(&self, ctx: &mut SessionContext, user: &User) -> AppResult<()> {
        // a fresh token on every login
        if let Some(previous) = ctx.token.take() {
            self.sessions.delete(previous).await?;
        }

        let now = Utc::now();
        let token = generate_token();
        self.sessions
            .create(Session {
                token: token.clone(),
                user_id: user.id,
                ip_address: ctx.ip_address.clone(),
                created_at: now,
                expires_at: now + seconds(self.config.session_lifetime_secs),
            })
            .await?;
        ctx.token = Some(token);
        debug!(user_id = user.id, "Session opened");
        Ok(())
    }

    async fn discard_session(&self, ctx: &mut SessionContext, token: String) {
        ctx.token = None;
        if let Err(err) = self.sessions.delete(token).await {
            warn!(error = %err, "Could not delete stale session");
        }
    }

    async fn audit_login_failure(
        &self,
        user_id: Option<UserId>,
        email: &str,
        reason: &str,
        ip: Option<String>,
    ) -> AppResult<()> {
        debug!(?user_id, reason, "Login failed");
        self.record(
            CreateAuditEntry::builder()
                .user_id(user_id)
                .action(AuditAction::LoginFailed)
                .table(AuditTable::Users)
                .record_id(user_id)
                .diff(AuditDiff::new().set("email", email).set("reason", reason))
                .description(format!("Fehlgeschlagene Anmeldung: {reason}"))
                .ip_address(ip),
        )
        .await
    }

    async fn record(&self, builder: AuditEntryBuilder) -> AppResult<()> {
        let entry = builder.try_build().map_err(|e| AppError::Internal(e.to_string()))?;
        let action = entry.action;
        if let Err(err) = self.audit.record(entry).await {
            error!(error = %err, action = %action, "Failed to write audit record");
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MockAuditRecorder;
    use crate::auth::{hash_password, MockSessionRepository};
    use crate::error::ErrorKind;
    use crate::notifications::LoggingNotificationGateway;
    use crate::users::{MockUserDirectory, MockUserStore, Role, RoleSet};
    use chrono::Duration;
    use mockall::predicate::eq;

    const PASSWORD: &str = "Richtig123";

    fn member(failed: u32) -> User {
        User {
            id: 7,
            email: "helga@verein.example".to_string(),
            name: "Helga".to_string(),
            is_active: true,
            roles: RoleSet::of(&[Role::Mitglied]),
            password_hash: Some(hash_password(PASSWORD, 4).unwrap()),
            totp_secret: None,
            email_2fa_enabled: false,
            failed_login_attempts: failed,
            locked_until: None,
            created_at: Utc::now(),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        }
    }

    fn service(
        users: MockUserDirectory,
        store: MockUserStore,
        sessions: MockSessionRepository,
        audit: MockAuditRecorder,
    ) -> AuthService {
        AuthService::new(
            Arc::new(users),
            Arc::new(store),
            Arc::new(sessions),
            Arc::new(audit),
            Arc::new(LoggingNotificationGateway::new()),
            config(),
        )
    }

    fn directory_with(user: User) -> MockUserDirectory {
        let mut users = MockUserDirectory::new();
        let by_email = user.clone();
        users
            .expect_find_by_email()
            .returning(move |_| Ok(Some(by_email.clone())));
        users
            .expect_find_by_id()
            .returning(move |_| Ok(Some(user.clone())));
        users
    }

    fn accepting_audit() -> MockAuditRecorder {
        let mut audit = MockAuditRecorder::new();
        audit.expect_record().returning(|_| Ok(()));
        audit
    }

    #[tokio::test]
    async fn test_fifth_failure_locks_account_for_configured_duration() {
        let mut store = MockUserStore::new();
        store
            .expect_record_failed_login()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(5));
        store
            .expect_lock_account()
            .with(eq(7), eq(900))
            .times(1)
            .returning(|_, _| Ok(()));

        let auth = service(
            directory_with(member(4)),
            store,
            MockSessionRepository::new(),
            accepting_audit(),
        );

        let err = auth
            .authenticate("helga@verein.example", "Falsch123", Some("192.0.2.1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(err.to_string().contains("gesperrt"));
        assert!(!err.to_string().contains("Verbleibende"));
    }

    #[tokio::test]
    async fn test_failure_below_limit_reports_remaining_attempts() {
        let mut store = MockUserStore::new();
        store.expect_record_failed_login().returning(|_| Ok(3));
        store.expect_lock_account().never();

        let auth = service(
            directory_with(member(2)),
            store,
            MockSessionRepository::new(),
            accepting_audit(),
        );

        let err = auth
            .authenticate("helga@verein.example", "Falsch123", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(err.to_string().contains("Verbleibende Versuche bis zur Sperrung: 2"));
    }

    #[tokio::test]
    async fn test_locked_account_rejects_correct_password() {
        let mut locked = member(0);
        locked.locked_until = Some(Utc::now() + Duration::minutes(10));

        // no expectations: the store must not be touched
        let auth = service(
            directory_with(locked),
            MockUserStore::new(),
            MockSessionRepository::new(),
            accepting_audit(),
        );

        let err = auth
            .authenticate("helga@verein.example", PASSWORD, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gesperrt"));
    }

    #[tokio::test]
    async fn test_unknown_email_is_audited_without_user() {
        let mut users = MockUserDirectory::new();
        users.expect_find_by_email().returning(|_| Ok(None));

        let mut audit = MockAuditRecorder::new();
        audit
            .expect_record()
            .withf(|entry| {
                entry.action == AuditAction::LoginFailed
                    && entry.user_id.is_none()
                    && entry.description.contains("user not found")
            })
            .times(1)
            .returning(|_| Ok(()));

        let auth = service(users, MockUserStore::new(), MockSessionRepository::new(), audit);
        let err = auth
            .authenticate("niemand@verein.example", PASSWORD, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), INVALID_CREDENTIALS);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let mut store = MockUserStore::new();
        store
            .expect_reset_failed_logins()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let auth = service(
            directory_with(member(3)),
            store,
            MockSessionRepository::new(),
            accepting_audit(),
        );

        let user = auth
            .authenticate("helga@verein.example", PASSWORD, None)
            .await
            .unwrap();
        assert_eq!(user.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn test_change_password_revokes_other_sessions() {
        let mut store = MockUserStore::new();
        store
            .expect_update_password()
            .withf(|id, hash| *id == 7 && hash.starts_with("$2"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut sessions = MockSessionRepository::new();
        sessions
            .expect_delete_all_for_user()
            .with(eq(7), eq(Some("current-token".to_string())))
            .times(1)
            .returning(|_, _| Ok(2));

        let auth = service(directory_with(member(0)), store, sessions, accepting_audit());
        let ctx = SessionContext::with_token("current-token", None);

        let revoked = auth.change_password(&ctx, 7, "NeuesPasswort9").await.unwrap();
        assert_eq!(revoked, 2);
    }

    #[tokio::test]
    async fn test_change_password_enforces_policy_before_writing() {
        let auth = service(
            MockUserDirectory::new(),
            MockUserStore::new(),
            MockSessionRepository::new(),
            MockAuditRecorder::new(),
        );
        let err = auth
            .change_password(&SessionContext::default(), 7, "schwach")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_no_session_means_not_authenticated() {
        let auth = service(
            MockUserDirectory::new(),
            MockUserStore::new(),
            MockSessionRepository::new(),
            MockAuditRecorder::new(),
        );
        let mut ctx = SessionContext::default();
        assert!(!auth.is_authenticated(&mut ctx).await);
        assert!(auth.current_user(&mut ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_deleted_lazily() {
        let mut sessions = MockSessionRepository::new();
        sessions.expect_find().returning(|token| {
            Ok(Some(Session {
                token,
                user_id: 7,
                ip_address: None,
                created_at: Utc::now() - Duration::hours(2),
                expires_at: Utc::now() - Duration::minutes(1),
            }))
        });
        sessions
            .expect_delete()
            .with(eq("old-token".to_string()))
            .times(1)
            .returning(|_| Ok(()));

        let auth = service(
            MockUserDirectory::new(),
            MockUserStore::new(),
            sessions,
            MockAuditRecorder::new(),
        );
        let mut ctx = SessionContext::with_token("old-token", None);
        assert!(auth.current_user(&mut ctx).await.is_none());
        assert_eq!(ctx.token(), None);
    }
}
