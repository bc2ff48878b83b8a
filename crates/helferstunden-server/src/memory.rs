//! In-memory backends for every storage and delivery seam
//!
//! They behave like the PostgreSQL implementations (version checks, hashed
//! tokens, soft deletes) and additionally let callers inspect what was
//! written or sent. Integration tests wire the services against these.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};

use crate::audit::{AuditAction, AuditRecorder, CreateAuditEntry};
use crate::auth::{hash_token, Session, SessionRepository};
use crate::error::{AppError, AppResult};
use crate::notifications::{NotificationError, NotificationGateway, NotificationKind};
use crate::users::{NewUser, Role, RoleSet, User, UserDirectory, UserId, UserStore};
use crate::workflow::{
    DialogMessage, DialogRepository, EntryStatus, NewDialogMessage, NewWorkEntry, WorkEntry,
    WorkEntryRepository,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn missing_user(user_id: UserId) -> AppError {
    AppError::not_found(format!("Benutzer {user_id} nicht gefunden."))
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone)]
struct StoredUser {
    user: User,
    invitation: Option<(String, DateTime<Utc>)>,
}

/// Users keyed by id, implementing both [`UserDirectory`] and [`UserStore`]
#[derive(Debug, Default)]
pub struct MemoryUserRepository {
    users: Mutex<HashMap<UserId, StoredUser>>,
    next_id: AtomicI64,
    locks: Mutex<Vec<(UserId, u64)>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Self::default()
        }
    }

    /// Add or replace a user
    pub fn insert(&self, user: User) {
        lock(&self.users).insert(
            user.id,
            StoredUser {
                user,
                invitation: None,
            },
        );
    }

    pub fn get(&self, user_id: UserId) -> Option<User> {
        lock(&self.users).get(&user_id).map(|stored| stored.user.clone())
    }

    /// Every `lock_account` call as `(user_id, duration_secs)`
    pub fn lock_calls(&self) -> Vec<(UserId, u64)> {
        lock(&self.locks).clone()
    }

    fn update(&self, user_id: UserId, change: impl FnOnce(&mut StoredUser)) -> AppResult<()> {
        let mut users = lock(&self.users);
        let stored = users.get_mut(&user_id).ok_or_else(|| missing_user(user_id))?;
        change(stored);
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryUserRepository {
    async fn find_by_id(&self, id: UserId) -> AppResult<Option<User>> {
        Ok(self.get(id))
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let email = email.trim();
        Ok(lock(&self.users)
            .values()
            .find(|stored| stored.user.email.eq_ignore_ascii_case(email))
            .map(|stored| stored.user.clone()))
    }

    async fn find_by_role(&self, role: Role) -> AppResult<Vec<User>> {
        let mut users: Vec<User> = lock(&self.users)
            .values()
            .filter(|stored| stored.user.is_active && stored.user.roles.contains(role))
            .map(|stored| stored.user.clone())
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }
}

#[async_trait]
impl UserStore for MemoryUserRepository {
    async fn record_failed_login(&self, user_id: UserId) -> AppResult<u32> {
        let mut users = lock(&self.users);
        let stored = users.get_mut(&user_id).ok_or_else(|| missing_user(user_id))?;
        stored.user.failed_login_attempts += 1;
        Ok(stored.user.failed_login_attempts)
    }

    async fn reset_failed_logins(&self, user_id: UserId) -> AppResult<()> {
        self.update(user_id, |stored| {
            stored.user.failed_login_attempts = 0;
            stored.user.locked_until = None;
        })
    }

    async fn lock_account(&self, user_id: UserId, duration_secs: u64) -> AppResult<()> {
        self.update(user_id, |stored| {
            stored.user.failed_login_attempts = 0;
            stored.user.locked_until = Some(Utc::now() + crate::auth::seconds(duration_secs));
        })?;
        lock(&self.locks).push((user_id, duration_secs));
        Ok(())
    }

    async fn update_password(&self, user_id: UserId, password_hash: String) -> AppResult<()> {
        self.update(user_id, |stored| stored.user.password_hash = Some(password_hash))
    }

    async fn set_totp_secret(&self, user_id: UserId, secret: Option<String>) -> AppResult<()> {
        self.update(user_id, |stored| stored.user.totp_secret = secret)
    }

    async fn set_email_2fa(&self, user_id: UserId, enabled: bool) -> AppResult<()> {
        self.update(user_id, |stored| stored.user.email_2fa_enabled = enabled)
    }

    async fn create_invited(&self, new_user: NewUser) -> AppResult<User> {
        if self.find_by_email(&new_user.email).await?.is_some() {
            return Err(AppError::validation(
                "Für diese E-Mail-Adresse existiert bereits ein Benutzerkonto.",
            ));
        }

        let user = User {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            email: new_user.email,
            name: new_user.name,
            is_active: false,
            roles: new_user.roles,
            password_hash: None,
            totp_secret: None,
            email_2fa_enabled: false,
            failed_login_attempts: 0,
            locked_until: None,
            created_at: Utc::now(),
        };
        lock(&self.users).insert(
            user.id,
            StoredUser {
                user: user.clone(),
                invitation: Some((new_user.invitation_token_hash, new_user.invitation_expires_at)),
            },
        );
        Ok(user)
    }

    async fn find_by_invitation(
        &self,
        token_hash: String,
    ) -> AppResult<Option<(User, DateTime<Utc>)>> {
        Ok(lock(&self.users).values().find_map(|stored| match &stored.invitation {
            Some((hash, expires_at)) if *hash == token_hash => {
                Some((stored.user.clone(), *expires_at))
            },
            _ => None,
        }))
    }

    async fn accept_invitation(&self, user_id: UserId, password_hash: String) -> AppResult<()> {
        self.update(user_id, |stored| {
            stored.user.password_hash = Some(password_hash);
            stored.user.is_active = true;
            stored.invitation = None;
        })
    }

    async fn set_roles(&self, user_id: UserId, roles: RoleSet) -> AppResult<()> {
        self.update(user_id, |stored| stored.user.roles = roles)
    }

    async fn set_active(&self, user_id: UserId, active: bool) -> AppResult<()> {
        self.update(user_id, |stored| stored.user.is_active = active)
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Sessions keyed by token hash
#[derive(Debug, Default)]
pub struct MemorySessionRepository {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_for(&self, user_id: UserId) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|session| session.user_id == user_id)
            .count()
    }

    /// Move a session's expiry, e.g. to simulate idle time
    pub fn set_expiry(&self, token: &str, expires_at: DateTime<Utc>) {
        if let Some(session) = lock(&self.sessions).get_mut(&hash_token(token)) {
            session.expires_at = expires_at;
        }
    }

    pub fn expiry_of(&self, token: &str) -> Option<DateTime<Utc>> {
        lock(&self.sessions)
            .get(&hash_token(token))
            .map(|session| session.expires_at)
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: Session) -> AppResult<()> {
        lock(&self.sessions).insert(hash_token(&session.token), session);
        Ok(())
    }

    async fn find(&self, token: String) -> AppResult<Option<Session>> {
        Ok(lock(&self.sessions).get(&hash_token(&token)).cloned())
    }

    async fn touch(&self, token: String, expires_at: DateTime<Utc>) -> AppResult<()> {
        self.set_expiry(&token, expires_at);
        Ok(())
    }

    async fn delete(&self, token: String) -> AppResult<()> {
        lock(&self.sessions).remove(&hash_token(&token));
        Ok(())
    }

    async fn delete_all_for_user(
        &self,
        user_id: UserId,
        except_token: Option<String>,
    ) -> AppResult<u64> {
        let keep = except_token.as_deref().map(hash_token);
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|hash, session| {
            session.user_id != user_id || keep.as_deref() == Some(hash.as_str())
        });
        Ok((before - sessions.len()) as u64)
    }
}

// ============================================================================
// Work entries and dialog
// ============================================================================

/// Entries and dialog messages
#[derive(Debug, Default)]
pub struct MemoryWorkflowRepository {
    entries: Mutex<HashMap<i64, WorkEntry>>,
    messages: Mutex<Vec<DialogMessage>>,
    next_id: AtomicI64,
    next_number: AtomicI64,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored state including soft-deleted entries
    pub fn get(&self, id: i64) -> Option<WorkEntry> {
        lock(&self.entries).get(&id).cloned()
    }

    /// Place an entry in a given state, bypassing the workflow
    pub fn put(&self, entry: WorkEntry) {
        self.next_id.fetch_max(entry.id, Ordering::SeqCst);
        lock(&self.entries).insert(entry.id, entry);
    }
}

#[async_trait]
impl WorkEntryRepository for MemoryWorkflowRepository {
    async fn insert(&self, new_entry: NewWorkEntry) -> AppResult<WorkEntry> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();

        let entry = WorkEntry {
            id,
            entry_number: format!("{}-{number:05}", now.year()),
            owner_id: new_entry.owner_id,
            creator_id: new_entry.creator_id,
            work_date: new_entry.work_date,
            hours: new_entry.hours,
            category_id: new_entry.category_id,
            project: new_entry.project,
            description: new_entry.description,
            status: EntryStatus::Entwurf,
            version: 1,
            corrected: false,
            status_before_cancel: None,
            submitted_at: None,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        lock(&self.entries).insert(id, entry.clone());
        Ok(entry)
    }

    async fn find(&self, id: i64) -> AppResult<Option<WorkEntry>> {
        Ok(self.get(id).filter(|entry| entry.deleted_at.is_none()))
    }

    async fn save(&self, mut entry: WorkEntry, expected_version: i64) -> AppResult<WorkEntry> {
        let mut entries = lock(&self.entries);
        let stored = entries
            .get_mut(&entry.id)
            .filter(|stored| {
                stored.deleted_at.is_none()
                    && stored.version == expected_version
                    && stored.updated_at == entry.updated_at
            })
            .ok_or_else(AppError::stale_version)?;

        entry.entry_number = stored.entry_number.clone();
        entry.created_at = stored.created_at;
        // strictly increasing, so a write in the same clock tick still moves it
        entry.updated_at = Utc::now().max(stored.updated_at + Duration::microseconds(1));
        *stored = entry.clone();
        Ok(entry)
    }
}

#[async_trait]
impl DialogRepository for MemoryWorkflowRepository {
    async fn add(&self, message: NewDialogMessage) -> AppResult<DialogMessage> {
        let mut messages = lock(&self.messages);
        let stored = DialogMessage {
            id: messages.len() as i64 + 1,
            entry_id: message.entry_id,
            sender_id: message.sender_id,
            body: message.body,
            is_read: false,
            created_at: Utc::now(),
            read_at: None,
        };
        messages.push(stored.clone());
        Ok(stored)
    }

    async fn list(&self, entry_id: i64) -> AppResult<Vec<DialogMessage>> {
        Ok(lock(&self.messages)
            .iter()
            .filter(|message| message.entry_id == entry_id)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, entry_id: i64, reader_id: UserId) -> AppResult<u64> {
        let now = Utc::now();
        let mut count = 0;
        for message in lock(&self.messages).iter_mut() {
            if message.entry_id == entry_id && message.sender_id != reader_id && !message.is_read {
                message.is_read = true;
                message.read_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Keeps audit records in memory; can be switched to fail every write
#[derive(Debug, Default)]
pub struct MemoryAuditRecorder {
    entries: Mutex<Vec<CreateAuditEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<CreateAuditEntry> {
        lock(&self.entries).clone()
    }

    pub fn with_action(&self, action: AuditAction) -> Vec<CreateAuditEntry> {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditRecorder for MemoryAuditRecorder {
    async fn record(&self, entry: CreateAuditEntry) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Internal("audit store unavailable".to_string()));
        }
        lock(&self.entries).push(entry);
        Ok(())
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// A notification handed to [`RecordingNotificationGateway`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub kind: NotificationKind,
    pub recipients: Vec<UserId>,
    pub entry_number: Option<String>,
    /// Reason, setup link or login code, depending on the kind
    pub detail: Option<String>,
}

/// Records notifications instead of sending them; can simulate a relay outage
#[derive(Debug, Default)]
pub struct RecordingNotificationGateway {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingNotificationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed deliveries are not recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        lock(&self.sent).clone()
    }

    pub fn sent_of(&self, kind: NotificationKind) -> Vec<SentNotification> {
        lock(&self.sent)
            .iter()
            .filter(|sent| sent.kind == kind)
            .cloned()
            .collect()
    }

    /// Most recent login code sent to `user_id`
    pub fn last_code_for(&self, user_id: UserId) -> Option<String> {
        lock(&self.sent)
            .iter()
            .rev()
            .find(|sent| {
                sent.kind == NotificationKind::TwoFactorCode && sent.recipients == [user_id]
            })
            .and_then(|sent| sent.detail.clone())
    }

    fn push(
        &self,
        kind: NotificationKind,
        recipients: Vec<UserId>,
        entry: Option<&WorkEntry>,
        detail: Option<&str>,
    ) -> Result<(), NotificationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Unavailable("relay offline".to_string()));
        }
        lock(&self.sent).push(SentNotification {
            kind,
            recipients,
            entry_number: entry.map(|e| e.entry_number.clone()),
            detail: detail.map(str::to_string),
        });
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for RecordingNotificationGateway {
    async fn entry_submitted(
        &self,
        entry: &WorkEntry,
        reviewers: &[User],
    ) -> Result<(), NotificationError> {
        let recipients = reviewers.iter().map(|u| u.id).collect();
        self.push(NotificationKind::EntrySubmitted, recipients, Some(entry), None)
    }

    async fn entry_approved(
        &self,
        entry: &WorkEntry,
        owner: &User,
    ) -> Result<(), NotificationError> {
        self.push(NotificationKind::EntryApproved, vec![owner.id], Some(entry), None)
    }

    async fn entry_rejected(
        &self,
        entry: &WorkEntry,
        owner: &User,
        reason: &str,
    ) -> Result<(), NotificationError> {
        self.push(NotificationKind::EntryRejected, vec![owner.id], Some(entry), Some(reason))
    }

    async fn entry_returned(
        &self,
        entry: &WorkEntry,
        owner: &User,
        reason: &str,
    ) -> Result<(), NotificationError> {
        self.push(NotificationKind::EntryReturned, vec![owner.id], Some(entry), Some(reason))
    }

    async fn invitation(&self, user: &User, setup_link: &str) -> Result<(), NotificationError> {
        self.push(NotificationKind::Invitation, vec![user.id], None, Some(setup_link))
    }

    async fn two_factor_code(&self, user: &User, code: &str) -> Result<(), NotificationError> {
        self.push(NotificationKind::TwoFactorCode, vec![user.id], None, Some(code))
    }
}
