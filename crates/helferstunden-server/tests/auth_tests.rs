//! Integration tests for authentication
//!
//! These tests verify:
//! - Lockout after repeated failed logins
//! - Emailed and TOTP second factors
//! - Session sliding expiry, logout and revocation on password change
//! - The second-factor setup gate

use chrono::{Duration, Utc};

use helferstunden_server::audit::AuditAction;
use helferstunden_server::auth::{
    generate_totp_secret, totp_for, two_factor_gate, GateDecision, LoginOutcome, SessionContext,
    TwoFactorMethod, LOGOUT_PATH, TWO_FACTOR_SETUP_PATH,
};
use helferstunden_server::users::Role;
use helferstunden_server::ErrorKind;

mod common;

use common::{Harness, PASSWORD};

const MEMBER: i64 = 10;

fn email(id: i64) -> String {
    format!("user{id}@verein.example")
}

async fn logged_in(h: &Harness, id: i64) -> SessionContext {
    let mut ctx = SessionContext::new(Some("192.0.2.10".to_string()));
    let outcome = h.auth().login(&mut ctx, &email(id), PASSWORD).await.unwrap();
    assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    ctx
}

#[tokio::test]
async fn test_login_opens_session() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();

    let mut ctx = logged_in(&h, MEMBER).await;

    assert!(ctx.token().is_some());
    assert_eq!(h.sessions.count_for(MEMBER), 1);
    let user = auth.current_user(&mut ctx).await.unwrap();
    assert_eq!(user.id, MEMBER);

    let logins = h.audit.with_action(AuditAction::Login);
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].ip_address.as_deref(), Some("192.0.2.10"));
}

#[tokio::test]
async fn test_email_lookup_ignores_case() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);

    let user = h
        .auth()
        .authenticate("USER10@Verein.Example", PASSWORD, None)
        .await
        .unwrap();
    assert_eq!(user.id, MEMBER);
}

#[tokio::test]
async fn test_lockout_after_five_failures() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();

    for remaining in (1..=4).rev() {
        let err = auth.authenticate(&email(MEMBER), "falsch", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(
            err.to_string()
                .contains(&format!("Verbleibende Versuche bis zur Sperrung: {remaining}")),
            "{err}"
        );
    }

    let err = auth.authenticate(&email(MEMBER), "falsch", None).await.unwrap_err();
    assert!(err.to_string().contains("gesperrt"), "{err}");
    assert_eq!(h.users.lock_calls(), vec![(MEMBER, 900)]);

    // the correct password no longer helps
    let err = auth.authenticate(&email(MEMBER), PASSWORD, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(err.to_string().contains("gesperrt"), "{err}");

    assert_eq!(h.audit.with_action(AuditAction::LoginFailed).len(), 6);
    assert!(h.audit.with_action(AuditAction::Login).is_empty());
}

#[tokio::test]
async fn test_lock_expires() {
    let h = Harness::new();
    let mut user = h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    user.locked_until = Some(Utc::now() - Duration::seconds(1));
    user.failed_login_attempts = 0;
    h.users.insert(user);

    let user = h.auth().authenticate(&email(MEMBER), PASSWORD, None).await.unwrap();
    assert_eq!(user.locked_until, None);
}

#[tokio::test]
async fn test_success_resets_failure_counter() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();

    for _ in 0..3 {
        auth.authenticate(&email(MEMBER), "falsch", None).await.unwrap_err();
    }
    assert_eq!(h.users.get(MEMBER).unwrap().failed_login_attempts, 3);

    auth.authenticate(&email(MEMBER), PASSWORD, None).await.unwrap();
    assert_eq!(h.users.get(MEMBER).unwrap().failed_login_attempts, 0);
}

#[tokio::test]
async fn test_unknown_and_inactive_users_get_generic_message() {
    let h = Harness::new();
    let mut inactive = h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    inactive.is_active = false;
    h.users.insert(inactive);
    let auth = h.auth();

    let unknown = auth
        .authenticate("niemand@verein.example", PASSWORD, None)
        .await
        .unwrap_err();
    let deactivated = auth.authenticate(&email(MEMBER), PASSWORD, None).await.unwrap_err();

    assert_eq!(unknown.to_string(), deactivated.to_string());
    assert!(h.users.lock_calls().is_empty());

    let failures = h.audit.with_action(AuditAction::LoginFailed);
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].user_id, None);
    assert_eq!(failures[1].user_id, Some(MEMBER));
}

#[tokio::test]
async fn test_email_code_second_factor() {
    let h = Harness::new();
    let mut user = h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    user.email_2fa_enabled = true;
    h.users.insert(user);
    let auth = h.auth();

    let mut ctx = SessionContext::new(None);
    let outcome = auth.login(&mut ctx, &email(MEMBER), PASSWORD).await.unwrap();
    assert!(matches!(
        outcome,
        LoginOutcome::SecondFactorRequired(TwoFactorMethod::EmailCode)
    ));
    assert!(ctx.token().is_none());
    assert_eq!(h.sessions.count_for(MEMBER), 0);

    let pending = auth.get_pending_2fa(&ctx).unwrap();
    assert_eq!(pending.user_id, MEMBER);

    let code = h.notifier.last_code_for(MEMBER).unwrap();
    assert_eq!(code.len(), 6);

    let wrong = if code == "000000" { "111111" } else { "000000" };
    let err = auth.verify_second_factor(&mut ctx, wrong).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(auth.get_pending_2fa(&ctx).unwrap().failed_attempts, 1);

    let user = auth.verify_second_factor(&mut ctx, &code).await.unwrap();
    assert_eq!(user.id, MEMBER);
    assert!(ctx.token().is_some());
    assert!(auth.get_pending_2fa(&ctx).is_none());
    assert_eq!(h.sessions.count_for(MEMBER), 1);
}

#[tokio::test]
async fn test_second_factor_attempts_are_limited() {
    let h = Harness::new();
    let mut user = h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    user.email_2fa_enabled = true;
    h.users.insert(user);
    let auth = h.auth();

    let mut ctx = SessionContext::new(None);
    auth.login(&mut ctx, &email(MEMBER), PASSWORD).await.unwrap();
    let code = h.notifier.last_code_for(MEMBER).unwrap();
    let wrong = if code == "000000" { "111111" } else { "000000" };

    for _ in 0..h.config.max_login_attempts {
        auth.verify_second_factor(&mut ctx, wrong).await.unwrap_err();
    }

    // the pending login is gone, even the right code fails now
    assert!(auth.get_pending_2fa(&ctx).is_none());
    let err = auth.verify_second_factor(&mut ctx, &code).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(h.sessions.count_for(MEMBER), 0);
}

#[tokio::test]
async fn test_email_code_delivery_failure_aborts_login() {
    let h = Harness::new();
    let mut user = h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    user.email_2fa_enabled = true;
    h.users.insert(user);
    h.notifier.set_failing(true);
    let auth = h.auth();

    let mut ctx = SessionContext::new(None);
    let err = auth.login(&mut ctx, &email(MEMBER), PASSWORD).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(auth.get_pending_2fa(&ctx).is_none());
}

#[tokio::test]
async fn test_totp_second_factor() {
    let h = Harness::new();
    let secret = generate_totp_secret();
    let mut user = h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    user.totp_secret = Some(secret.clone());
    // TOTP takes precedence over email codes
    user.email_2fa_enabled = true;
    h.users.insert(user);
    let auth = h.auth();

    let mut ctx = SessionContext::new(None);
    let outcome = auth.login(&mut ctx, &email(MEMBER), PASSWORD).await.unwrap();
    assert!(matches!(outcome, LoginOutcome::SecondFactorRequired(TwoFactorMethod::Totp)));
    assert!(h.notifier.last_code_for(MEMBER).is_none());

    let code = totp_for(&secret).unwrap().generate_current().unwrap();
    auth.verify_second_factor(&mut ctx, &code).await.unwrap();
    assert!(auth.is_authenticated(&mut ctx).await);
}

#[tokio::test]
async fn test_enable_totp_requires_valid_code() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();
    let secret = generate_totp_secret();

    let err = auth.enable_totp(MEMBER, &secret, "12345").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.users.get(MEMBER).unwrap().totp_secret.is_none());

    let code = totp_for(&secret).unwrap().generate_current().unwrap();
    auth.enable_totp(MEMBER, &secret, &code).await.unwrap();
    assert_eq!(h.users.get(MEMBER).unwrap().totp_secret, Some(secret));
}

#[tokio::test]
async fn test_session_expiry_slides_on_activity() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();
    let mut ctx = logged_in(&h, MEMBER).await;
    let token = ctx.token().unwrap().to_string();

    h.sessions.set_expiry(&token, Utc::now() + Duration::seconds(10));
    assert!(auth.is_authenticated(&mut ctx).await);

    let extended = h.sessions.expiry_of(&token).unwrap();
    assert!(extended > Utc::now() + Duration::seconds(1700));
}

#[tokio::test]
async fn test_expired_session_is_discarded() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();
    let mut ctx = logged_in(&h, MEMBER).await;
    let token = ctx.token().unwrap().to_string();

    h.sessions.set_expiry(&token, Utc::now() - Duration::seconds(1));

    assert!(auth.current_user(&mut ctx).await.is_none());
    assert!(ctx.token().is_none());
    assert_eq!(h.sessions.count_for(MEMBER), 0);
}

#[tokio::test]
async fn test_unknown_token_is_not_authenticated() {
    let h = Harness::new();
    let mut ctx = SessionContext::with_token("deadbeef", None);
    assert!(!h.auth().is_authenticated(&mut ctx).await);
}

#[tokio::test]
async fn test_logout_ends_session() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();
    let mut ctx = logged_in(&h, MEMBER).await;
    let token = ctx.token().unwrap().to_string();

    auth.logout(&mut ctx).await.unwrap();

    assert!(ctx.token().is_none());
    assert_eq!(h.sessions.count_for(MEMBER), 0);
    let mut stale = SessionContext::with_token(token, None);
    assert!(!auth.is_authenticated(&mut stale).await);
    assert_eq!(h.audit.with_action(AuditAction::Logout).len(), 1);
}

#[tokio::test]
async fn test_password_change_revokes_other_sessions() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();

    let mut current = logged_in(&h, MEMBER).await;
    let mut other = logged_in(&h, MEMBER).await;
    assert_eq!(h.sessions.count_for(MEMBER), 2);

    let revoked = auth
        .change_password(&current, MEMBER, "Herbstmarkt2026?")
        .await
        .unwrap();

    assert_eq!(revoked, 1);
    assert!(auth.is_authenticated(&mut current).await);
    assert!(!auth.is_authenticated(&mut other).await);

    auth.authenticate(&email(MEMBER), "Herbstmarkt2026?", None).await.unwrap();
    auth.authenticate(&email(MEMBER), PASSWORD, None).await.unwrap_err();
}

#[tokio::test]
async fn test_weak_password_is_refused() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let ctx = logged_in(&h, MEMBER).await;

    let err = h.auth().change_password(&ctx, MEMBER, "kurz").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.sessions.count_for(MEMBER), 1);
}

#[tokio::test]
async fn test_deactivated_user_loses_session() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let auth = h.auth();
    let mut ctx = logged_in(&h, MEMBER).await;

    let mut user = h.users.get(MEMBER).unwrap();
    user.is_active = false;
    h.users.insert(user);

    assert!(auth.current_user(&mut ctx).await.is_none());
    assert_eq!(h.sessions.count_for(MEMBER), 0);
}

#[tokio::test]
async fn test_actor_carries_session_reference() {
    let h = Harness::new();
    h.add_user_with_password(MEMBER, &[Role::Mitglied]);
    let mut ctx = logged_in(&h, MEMBER).await;

    let actor = h.auth().actor(&mut ctx).await.unwrap();
    assert_eq!(actor.id(), MEMBER);
    assert_eq!(actor.ip_address.as_deref(), Some("192.0.2.10"));
    assert_eq!(actor.session_id, ctx.session_reference());
}

#[tokio::test]
async fn test_gate_sends_users_without_second_factor_to_setup() {
    let mut h = Harness::new();
    h.config.require_two_factor = true;
    let user = h.add_user(MEMBER, &[Role::Mitglied]);

    assert_eq!(
        two_factor_gate(&user, "/eintraege", &h.config),
        GateDecision::RedirectToSetup
    );
    assert_eq!(two_factor_gate(&user, TWO_FACTOR_SETUP_PATH, &h.config), GateDecision::Proceed);
    assert_eq!(two_factor_gate(&user, LOGOUT_PATH, &h.config), GateDecision::Proceed);

    let mut secured = user.clone();
    secured.email_2fa_enabled = true;
    assert_eq!(two_factor_gate(&secured, "/eintraege", &h.config), GateDecision::Proceed);
}
