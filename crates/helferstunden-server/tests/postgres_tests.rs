//! PostgreSQL repository tests
//!
//! Each test gets a fresh database with the migrations applied. They need
//! `DATABASE_URL` and run with `cargo test -- --ignored`.

use bigdecimal::BigDecimal;
use chrono::{Duration, NaiveDate, Utc};
use sqlx::PgPool;

use helferstunden_server::audit::{
    query_audit_logs, AuditAction, AuditDiff, AuditQuery, AuditRecorder, AuditTable,
    CreateAuditEntry, PgAuditRecorder,
};
use helferstunden_server::auth::{hash_token, PgSessionRepository, Session, SessionRepository};
use helferstunden_server::users::{
    NewUser, PgUserRepository, Role, RoleSet, User, UserDirectory, UserStore,
};
use helferstunden_server::workflow::{
    DialogRepository, EntryStatus, NewDialogMessage, NewWorkEntry, PgWorkflowRepository,
    WorkEntryRepository,
};
use helferstunden_server::ErrorKind;

async fn active_user(repo: &PgUserRepository, email: &str, roles: &[Role]) -> User {
    let user = repo
        .create_invited(NewUser {
            email: email.to_string(),
            name: email.to_string(),
            roles: RoleSet::of(roles),
            invitation_token_hash: hash_token(email),
            invitation_expires_at: Utc::now() + Duration::days(7),
        })
        .await
        .unwrap();
    repo.accept_invitation(user.id, "hash".to_string()).await.unwrap();
    repo.find_by_id(user.id).await.unwrap().unwrap()
}

fn draft(owner_id: i64) -> NewWorkEntry {
    NewWorkEntry {
        owner_id,
        creator_id: owner_id,
        work_date: NaiveDate::from_ymd_opt(2026, 4, 18).unwrap(),
        hours: "2.5".parse::<BigDecimal>().unwrap(),
        category_id: None,
        project: None,
        description: "Vereinsheim gestrichen".to_string(),
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_user_roundtrip(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let repo = PgUserRepository::new(pool);
    let user = active_user(&repo, "Pruefer@Verein.example", &[Role::Pruefer]).await;

    assert!(user.is_active);
    assert_eq!(user.roles, RoleSet::of(&[Role::Pruefer]));

    let found = repo.find_by_email("pruefer@verein.example").await?.unwrap();
    assert_eq!(found.id, user.id);

    let reviewers = repo.find_by_role(Role::Pruefer).await?;
    assert_eq!(reviewers.len(), 1);

    assert_eq!(repo.record_failed_login(user.id).await?, 1);
    assert_eq!(repo.record_failed_login(user.id).await?, 2);
    repo.lock_account(user.id, 900).await?;
    let locked = repo.find_by_id(user.id).await?.unwrap();
    assert_eq!(locked.failed_login_attempts, 0);
    assert!(locked.is_locked_at(Utc::now()));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_entry_save_checks_version(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let users = PgUserRepository::new(pool.clone());
    let owner = active_user(&users, "owner@verein.example", &[Role::Mitglied]).await;
    let repo = PgWorkflowRepository::new(pool);

    let entry = repo.insert(draft(owner.id)).await?;
    assert_eq!(entry.status, EntryStatus::Entwurf);
    assert_eq!(entry.version, 1);
    assert_eq!(entry.entry_number.len(), "2026-00001".len());

    let mut submitted = entry.clone();
    submitted.status = EntryStatus::Eingereicht;
    submitted.version = 2;
    let saved = repo.save(submitted.clone(), 1).await?;
    assert_eq!(saved.status, EntryStatus::Eingereicht);

    let err = repo.save(submitted, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // same version, but the row was written after it was read
    let mut corrected = saved.clone();
    corrected.corrected = true;
    let rewritten = repo.save(corrected.clone(), 2).await?;
    assert!(rewritten.updated_at > saved.updated_at);
    let err = repo.save(corrected, 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let second = repo.insert(draft(owner.id)).await?;
    assert_ne!(second.entry_number, entry.entry_number);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_dialog_read_marks(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let users = PgUserRepository::new(pool.clone());
    let owner = active_user(&users, "owner@verein.example", &[Role::Mitglied]).await;
    let reviewer = active_user(&users, "pruefer@verein.example", &[Role::Pruefer]).await;
    let repo = PgWorkflowRepository::new(pool);
    let entry = repo.insert(draft(owner.id)).await?;

    repo.add(NewDialogMessage {
        entry_id: entry.id,
        sender_id: reviewer.id,
        body: "Wie lange genau?".to_string(),
    })
    .await?;

    assert_eq!(repo.list(entry.id).await?.len(), 1);
    assert_eq!(repo.mark_read(entry.id, reviewer.id).await?, 0);
    assert_eq!(repo.mark_read(entry.id, owner.id).await?, 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_sessions_store_token_hash(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let users = PgUserRepository::new(pool.clone());
    let user = active_user(&users, "member@verein.example", &[Role::Mitglied]).await;
    let repo = PgSessionRepository::new(pool.clone());

    for token in ["erste", "zweite"] {
        repo.create(Session {
            token: token.to_string(),
            user_id: user.id,
            ip_address: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(30),
        })
        .await?;
    }

    let stored: Vec<String> = sqlx::query_scalar("SELECT token_hash FROM sessions")
        .fetch_all(&pool)
        .await?;
    assert!(stored.contains(&hash_token("erste")));
    assert!(!stored.iter().any(|hash| hash == "erste"));

    assert!(repo.find("erste".to_string()).await?.is_some());
    assert_eq!(repo.delete_all_for_user(user.id, Some("erste".to_string())).await?, 1);
    assert!(repo.find("zweite".to_string()).await?.is_none());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_audit_log_is_append_only(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let recorder = PgAuditRecorder::new(pool.clone());
    let entry = CreateAuditEntry::builder()
        .action(AuditAction::LoginFailed)
        .table(AuditTable::Users)
        .diff(AuditDiff::new().set("email", "niemand@verein.example"))
        .description("Fehlgeschlagene Anmeldung: user not found")
        .ip_address(Some("192.0.2.1".to_string()))
        .try_build()?;
    recorder.record(entry).await?;

    let logs = query_audit_logs(
        &pool,
        AuditQuery {
            action: Some(AuditAction::LoginFailed),
            ..AuditQuery::default()
        },
    )
    .await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].user_id, None);
    assert_eq!(logs[0].ip_address.as_deref(), Some("192.0.2.1"));

    let result = sqlx::query("DELETE FROM audit_log").execute(&pool).await;
    assert!(result.is_err());

    Ok(())
}
