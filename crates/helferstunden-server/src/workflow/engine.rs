//! Work entry state machine
//!
//! Every operation on an existing entry runs the same checks in the same
//! order: role or relationship (`Authorization`), presented version
//! (`Conflict`), transition table (`BusinessRule`), self-approval
//! (`BusinessRule`), required reason (`BusinessRule`). Only then is the entry
//! written, audited and, where the table asks for it, notified about.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::entry::{
    validate_description, validate_hours, Correction, DialogMessage, DraftChanges, EntryInput,
    NewDialogMessage, NewWorkEntry, WorkEntry,
};
use super::repository::{DialogRepository, WorkEntryRepository};
use super::status::{EntryStatus, Operation};
use crate::audit::{AuditAction, AuditDiff, AuditRecorder, AuditTable, CreateAuditEntry};
use crate::auth::Actor;
use crate::error::{AppError, AppResult};
use crate::notifications::{NotificationError, NotificationGateway, NotificationKind};
use crate::users::{Role, User, UserDirectory};

/// Result of a committed transition
///
/// `warnings` carries non-fatal problems (undelivered notifications) that
/// the caller should surface without treating the operation as failed.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub entry: WorkEntry,
    pub warnings: Vec<String>,
}

/// Drives work entries through their life cycle
#[derive(Clone)]
pub struct WorkflowEngine {
    entries: Arc<dyn WorkEntryRepository>,
    dialog: Arc<dyn DialogRepository>,
    users: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditRecorder>,
    notifier: Arc<dyn NotificationGateway>,
}

impl WorkflowEngine {
    pub fn new(
        entries: Arc<dyn WorkEntryRepository>,
        dialog: Arc<dyn DialogRepository>,
        users: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditRecorder>,
        notifier: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            entries,
            dialog,
            users,
            audit,
            notifier,
        }
    }

    // ------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------

    /// Create a draft for the actor or, with `erfasser` rights, for another member
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn create_entry(&self, actor: &Actor, input: EntryInput) -> AppResult<WorkEntry> {
        let user = self.load_actor(actor).await?;
        let owner_id = input.owner_id.unwrap_or(user.id);

        if owner_id != user.id {
            if !user.roles.can_record_for_others() {
                return Err(AppError::authorization(
                    "Sie dürfen keine Einträge für andere Mitglieder erfassen.",
                ));
            }
            match self.users.find_by_id(owner_id).await? {
                Some(owner) if owner.is_active => {},
                _ => {
                    return Err(AppError::validation(
                        "Das ausgewählte Mitglied existiert nicht oder ist nicht aktiv.",
                    ))
                },
            }
        }

        validate_hours(&input.hours)?;
        validate_description(&input.description)?;

        let entry = self
            .entries
            .insert(NewWorkEntry {
                owner_id,
                creator_id: user.id,
                work_date: input.work_date,
                hours: input.hours,
                category_id: input.category_id,
                project: input.project.filter(|p| !p.trim().is_empty()),
                description: input.description.trim().to_string(),
            })
            .await?;

        let diff = AuditDiff::new()
            .set("entry_number", &entry.entry_number)
            .set("owner_id", entry.owner_id)
            .set("creator_id", entry.creator_id)
            .set("work_date", entry.work_date)
            .set("hours", &entry.hours)
            .set("description", &entry.description)
            .set("status", entry.status);
        self.record(actor, AuditAction::Create, AuditTable::WorkEntries, Some(entry.id), diff,
            format!("Eintrag {} angelegt", entry.entry_number))
            .await?;

        info!(entry_number = %entry.entry_number, owner_id, "Work entry created");
        Ok(entry)
    }

    /// Edit a draft in place
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn update_draft(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
        changes: DraftChanges,
    ) -> AppResult<WorkEntry> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        check_party(&user, &entry)?;
        check_version(&entry, version)?;
        if entry.status != EntryStatus::Entwurf {
            return Err(AppError::business_rule("Nur Entwürfe können bearbeitet werden."));
        }
        if changes.is_empty() {
            return Err(AppError::validation("Es wurden keine Änderungen angegeben."));
        }

        let mut updated = entry.clone();
        let mut diff = AuditDiff::new();

        if let Some(work_date) = changes.work_date.filter(|d| *d != entry.work_date) {
            diff = diff.changed("work_date", entry.work_date, work_date);
            updated.work_date = work_date;
        }
        if let Some(hours) = changes.hours.filter(|h| *h != entry.hours) {
            validate_hours(&hours)?;
            diff = diff.changed("hours", &entry.hours, &hours);
            updated.hours = hours;
        }
        if let Some(category_id) = changes.category_id.filter(|c| *c != entry.category_id) {
            diff = diff.changed("category_id", entry.category_id, category_id);
            updated.category_id = category_id;
        }
        if let Some(project) = changes.project.filter(|p| *p != entry.project) {
            diff = diff.changed("project", &entry.project, &project);
            updated.project = project;
        }
        if let Some(description) = changes.description {
            validate_description(&description)?;
            let description = description.trim().to_string();
            if description != entry.description {
                diff = diff.changed("description", &entry.description, &description);
                updated.description = description;
            }
        }

        if diff.is_empty() {
            debug!(entry_number = %entry.entry_number, "Draft update without effective changes");
            return Ok(entry);
        }

        updated.version += 1;
        let diff = diff.changed("version", entry.version, updated.version);
        let saved = self.entries.save(updated, version).await?;
        self.record(actor, AuditAction::Update, AuditTable::WorkEntries, Some(saved.id), diff,
            format!("Entwurf {} bearbeitet", saved.entry_number))
            .await?;

        Ok(saved)
    }

    /// Soft-delete a draft
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn delete_entry(&self, actor: &Actor, entry_id: i64, version: i64) -> AppResult<()> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        check_party(&user, &entry)?;
        check_version(&entry, version)?;
        if entry.status != EntryStatus::Entwurf {
            return Err(AppError::business_rule("Nur Entwürfe können gelöscht werden."));
        }

        let now = Utc::now();
        let mut updated = entry.clone();
        updated.deleted_at = Some(now);
        updated.version += 1;
        let saved = self.entries.save(updated, version).await?;

        let diff = AuditDiff::new()
            .set("deleted_at", now)
            .unset("hours", &entry.hours)
            .unset("description", &entry.description);
        self.record(actor, AuditAction::Delete, AuditTable::WorkEntries, Some(saved.id), diff,
            format!("Entwurf {} gelöscht", saved.entry_number))
            .await?;

        info!(entry_number = %saved.entry_number, "Draft deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn submit(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::Submit, None).await
    }

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn approve(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::Approve, None).await
    }

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn reject(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
        reason: &str,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::Reject, Some(reason)).await
    }

    /// Send the entry back to its owner with a question; opens the dialog
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn return_for_revision(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
        reason: &str,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::ReturnForRevision, Some(reason))
            .await
    }

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn cancel(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::Cancel, None).await
    }

    /// Undo a cancellation, restoring the state the entry was cancelled from
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn reactivate(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::Reactivate, None).await
    }

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn withdraw(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
    ) -> AppResult<TransitionOutcome> {
        self.transition(actor, entry_id, version, Operation::Withdraw, None).await
    }

    /// Fix hours or description of an approved entry without a new review
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn correct(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
        correction: Correction,
    ) -> AppResult<TransitionOutcome> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        check_operation(Operation::Correct, &user, &entry, version, Some(&correction.reason))?;
        if correction.read_at != entry.updated_at {
            return Err(AppError::stale_version());
        }

        if correction.hours.is_none() && correction.description.is_none() {
            return Err(AppError::validation(
                "Bitte geben Sie die zu korrigierenden Werte an.",
            ));
        }

        let mut updated = entry.clone();
        let mut diff = AuditDiff::new();
        if let Some(hours) = correction.hours.filter(|h| *h != entry.hours) {
            validate_hours(&hours)?;
            diff = diff.changed("hours", &entry.hours, &hours);
            updated.hours = hours;
        }
        if let Some(description) = correction.description {
            validate_description(&description)?;
            let description = description.trim().to_string();
            if description != entry.description {
                diff = diff.changed("description", &entry.description, &description);
                updated.description = description;
            }
        }
        if diff.is_empty() {
            return Err(AppError::validation("Die Korrektur enthält keine Änderungen."));
        }

        updated.corrected = true;
        let diff = diff
            .changed("corrected", entry.corrected, true)
            .set("reason", correction.reason.trim());
        let saved = self.entries.save(updated, version).await?;

        self.record(actor, AuditAction::Update, AuditTable::WorkEntries, Some(saved.id), diff,
            format!("Eintrag {} korrigiert", saved.entry_number))
            .await?;

        info!(entry_number = %saved.entry_number, "Approved entry corrected");
        Ok(TransitionOutcome {
            entry: saved,
            warnings: Vec::new(),
        })
    }

    async fn transition(
        &self,
        actor: &Actor,
        entry_id: i64,
        version: i64,
        op: Operation,
        reason: Option<&str>,
    ) -> AppResult<TransitionOutcome> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        let target = check_operation(op, &user, &entry, version, reason)?;
        let reason = reason.map(str::trim);

        let updated = apply(op, &entry, target, user.id, reason);
        let saved = self.entries.save(updated, version).await?;

        let mut diff = AuditDiff::new()
            .changed("status", entry.status, saved.status)
            .changed("version", entry.version, saved.version);
        if let Some(reason) = reason {
            diff = diff.set("reason", reason);
        }
        if let Some(prior) = saved.status_before_cancel {
            diff = diff.set("status_before_cancel", prior);
        }
        // committed: question and notification still go out if auditing fails
        let mut failure = self
            .record(actor, AuditAction::StatusChange, AuditTable::WorkEntries, Some(saved.id), diff,
                format!("Eintrag {} {}", saved.entry_number, op.participle()))
            .await
            .err();

        if let (Operation::ReturnForRevision, Some(question)) = (op, reason) {
            if let Err(err) = self.post_message(actor, &saved, user.id, question).await {
                failure.get_or_insert(err);
            }
        }

        info!(
            entry_number = %saved.entry_number,
            from = %entry.status,
            to = %saved.status,
            "Entry transition committed"
        );

        let warnings = self.notify(op, &saved, reason).await;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(TransitionOutcome {
            entry: saved,
            warnings,
        })
    }

    // ------------------------------------------------------------------
    // Dialog
    // ------------------------------------------------------------------

    /// Reply in the clarification thread of an entry in `in_klaerung`
    #[instrument(skip(self, actor, body), fields(actor_id = actor.id()))]
    pub async fn add_dialog_message(
        &self,
        actor: &Actor,
        entry_id: i64,
        body: &str,
    ) -> AppResult<DialogMessage> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        check_dialog_access(&user, &entry)?;
        if entry.status != EntryStatus::InKlaerung {
            return Err(AppError::business_rule(
                "Rückfragen sind nur bei Einträgen in Klärung möglich.",
            ));
        }
        if body.trim().is_empty() {
            return Err(AppError::validation("Die Nachricht darf nicht leer sein."));
        }

        self.post_message(actor, &entry, user.id, body.trim()).await
    }

    /// Mark the messages the actor received on this entry as read
    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn mark_dialog_read(&self, actor: &Actor, entry_id: i64) -> AppResult<u64> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        check_dialog_access(&user, &entry)?;
        self.dialog.mark_read(entry.id, user.id).await
    }

    #[instrument(skip(self, actor), fields(actor_id = actor.id()))]
    pub async fn list_dialog(&self, actor: &Actor, entry_id: i64) -> AppResult<Vec<DialogMessage>> {
        let user = self.load_actor(actor).await?;
        let entry = self.load_entry(entry_id).await?;
        if !user.roles.can_audit() {
            check_dialog_access(&user, &entry)?;
        }
        self.dialog.list(entry.id).await
    }

    async fn post_message(
        &self,
        actor: &Actor,
        entry: &WorkEntry,
        sender_id: i64,
        body: &str,
    ) -> AppResult<DialogMessage> {
        let message = self
            .dialog
            .add(NewDialogMessage {
                entry_id: entry.id,
                sender_id,
                body: body.to_string(),
            })
            .await?;

        let diff = AuditDiff::new()
            .set("entry_id", entry.id)
            .set("body", &message.body);
        self.record(actor, AuditAction::DialogMessage, AuditTable::DialogMessages, Some(message.id),
            diff, format!("Rückfrage zu Eintrag {}", entry.entry_number))
            .await?;

        Ok(message)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Re-read the actor so deactivation and role changes apply immediately
    async fn load_actor(&self, actor: &Actor) -> AppResult<User> {
        match self.users.find_by_id(actor.id()).await? {
            Some(user) if user.is_active => Ok(user),
            _ => Err(AppError::authorization("Ihr Benutzerkonto ist nicht aktiv.")),
        }
    }

    async fn load_entry(&self, entry_id: i64) -> AppResult<WorkEntry> {
        self.entries
            .find(entry_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Eintrag {entry_id} wurde nicht gefunden.")))
    }

    async fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        table: AuditTable,
        record_id: Option<i64>,
        diff: AuditDiff,
        description: String,
    ) -> AppResult<()> {
        let entry = CreateAuditEntry::builder()
            .user_id(Some(actor.id()))
            .action(action)
            .table(table)
            .record_id(record_id)
            .diff(diff)
            .description(description)
            .ip_address(actor.ip_address.clone())
            .session_id(actor.session_id.clone())
            .try_build()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        if let Err(err) = self.audit.record(entry).await {
            error!(error = %err, action = %action, ?record_id, "Failed to write audit record");
            return Err(err);
        }
        Ok(())
    }

    /// Active users who may review `entry`, excluding its owner and creator
    async fn reviewers_of(&self, entry: &WorkEntry) -> AppResult<Vec<User>> {
        let mut reviewers = self.users.find_by_role(Role::Pruefer).await?;
        reviewers.extend(self.users.find_by_role(Role::Administrator).await?);
        reviewers.retain(|u| !entry.is_party(u.id));
        reviewers.sort_by_key(|u| u.id);
        reviewers.dedup_by_key(|u| u.id);
        Ok(reviewers)
    }

    async fn notify(&self, op: Operation, entry: &WorkEntry, reason: Option<&str>) -> Vec<String> {
        let reason = reason.unwrap_or_default();
        let (kind, result) = match op {
            Operation::Submit => {
                let reviewers = match self.reviewers_of(entry).await {
                    Ok(users) => users,
                    Err(err) => {
                        warn!(error = %err, "Could not resolve reviewers");
                        return vec![undelivered(NotificationKind::EntrySubmitted)];
                    },
                };
                if reviewers.is_empty() {
                    debug!(entry_number = %entry.entry_number, "No reviewers to notify");
                    return Vec::new();
                }
                (
                    NotificationKind::EntrySubmitted,
                    self.notifier.entry_submitted(entry, &reviewers).await,
                )
            },
            Operation::Approve | Operation::Reject | Operation::ReturnForRevision => {
                let kind = match op {
                    Operation::Approve => NotificationKind::EntryApproved,
                    Operation::Reject => NotificationKind::EntryRejected,
                    _ => NotificationKind::EntryReturned,
                };
                let owner = match self.users.find_by_id(entry.owner_id).await {
                    Ok(Some(owner)) => owner,
                    Ok(None) => {
                        warn!(owner_id = entry.owner_id, "Entry owner not found");
                        return vec![undelivered(kind)];
                    },
                    Err(err) => {
                        warn!(error = %err, "Could not resolve entry owner");
                        return vec![undelivered(kind)];
                    },
                };
                let result = match kind {
                    NotificationKind::EntryApproved => {
                        self.notifier.entry_approved(entry, &owner).await
                    },
                    NotificationKind::EntryRejected => {
                        self.notifier.entry_rejected(entry, &owner, reason).await
                    },
                    _ => self.notifier.entry_returned(entry, &owner, reason).await,
                };
                (kind, result)
            },
            _ => return Vec::new(),
        };

        delivery_warning(kind, entry, result).into_iter().collect()
    }
}

fn undelivered(kind: NotificationKind) -> String {
    format!("Die Benachrichtigung ({kind}) konnte nicht versendet werden.")
}

fn delivery_warning(
    kind: NotificationKind,
    entry: &WorkEntry,
    result: Result<(), NotificationError>,
) -> Option<String> {
    match result {
        Ok(()) => None,
        Err(err) => {
            warn!(kind = %kind, entry_number = %entry.entry_number, error = %err,
                "Notification could not be delivered");
            Some(undelivered(kind))
        },
    }
}

fn check_party(user: &User, entry: &WorkEntry) -> AppResult<()> {
    if entry.is_party(user.id) {
        Ok(())
    } else {
        Err(AppError::authorization(
            "Sie dürfen nur eigene oder von Ihnen erfasste Einträge bearbeiten.",
        ))
    }
}

fn check_version(entry: &WorkEntry, version: i64) -> AppResult<()> {
    if entry.version == version {
        Ok(())
    } else {
        Err(AppError::stale_version())
    }
}

fn check_dialog_access(user: &User, entry: &WorkEntry) -> AppResult<()> {
    if entry.is_party(user.id) || user.roles.can_review() {
        Ok(())
    } else {
        Err(AppError::authorization(
            "Sie haben keinen Zugriff auf die Rückfragen zu diesem Eintrag.",
        ))
    }
}

fn invalid_transition(from: EntryStatus, op: Operation) -> AppError {
    if from.is_terminal() {
        AppError::business_rule(format!(
            "Der Eintrag ist abgeschlossen (Status '{}') und kann nicht mehr {} werden.",
            from.label(),
            op.participle()
        ))
    } else {
        AppError::business_rule(format!(
            "Ungültiger Statusübergang: Ein Eintrag im Status '{}' kann nicht {} werden.",
            from.label(),
            op.participle()
        ))
    }
}

/// Validate `op` for `actor` on `entry` and return the target state
pub(crate) fn check_operation(
    op: Operation,
    actor: &User,
    entry: &WorkEntry,
    version: i64,
    reason: Option<&str>,
) -> AppResult<EntryStatus> {
    if op.is_review() {
        if !actor.roles.can_review() {
            return Err(AppError::authorization(
                "Sie haben keine Berechtigung, Einträge zu prüfen.",
            ));
        }
    } else {
        check_party(actor, entry)?;
    }

    check_version(entry, version)?;

    let target = entry
        .status
        .transition(op)
        .ok_or_else(|| invalid_transition(entry.status, op))?;

    if op.is_review() {
        if entry.is_owned_by(actor.id) {
            return Err(AppError::business_rule(format!(
                "Eigene Einträge dürfen nicht selbst {} werden.",
                op.participle()
            )));
        }
        if entry.is_created_by(actor.id) {
            return Err(AppError::business_rule(format!(
                "Von Ihnen erstellte Einträge dürfen nicht selbst {} werden.",
                op.participle()
            )));
        }
    }

    if op.requires_reason() && reason.map_or(true, |r| r.trim().is_empty()) {
        return Err(AppError::business_rule("Bitte geben Sie eine Begründung an."));
    }

    Ok(target)
}

/// The entry as it looks after `op`, version bumped where the table says so
fn apply(
    op: Operation,
    entry: &WorkEntry,
    target: EntryStatus,
    actor_id: i64,
    reason: Option<&str>,
) -> WorkEntry {
    let now = Utc::now();
    let mut updated = entry.clone();
    updated.status = target;

    match op {
        Operation::Submit => {
            updated.submitted_at = Some(now);
            updated.rejection_reason = None;
        },
        Operation::Approve => {
            updated.reviewed_by = Some(actor_id);
            updated.reviewed_at = Some(now);
        },
        Operation::Reject => {
            updated.reviewed_by = Some(actor_id);
            updated.reviewed_at = Some(now);
            updated.rejection_reason = reason.map(str::to_string);
        },
        Operation::Cancel => {
            updated.status_before_cancel = Some(entry.status);
        },
        Operation::Reactivate => {
            updated.status = entry.status_before_cancel.unwrap_or(target);
            updated.status_before_cancel = None;
        },
        Operation::Withdraw => {
            updated.submitted_at = None;
        },
        Operation::ReturnForRevision | Operation::Correct => {},
    }

    if op.bumps_version() {
        updated.version += 1;
    }
    updated
}
