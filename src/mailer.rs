//! Outgoing mail is queued in `email_outbox`; a separate relay drains it.

use serde_json::json;
use sqlx::SqlitePool;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::audit::log_message;
use crate::config::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailKind {
    PasswordReset,
    PasswordChanged,
    TwoFactorSetup,
    LoginAlert,
    AccountLinked,
}

impl MailKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MailKind::PasswordReset => "password-reset",
            MailKind::PasswordChanged => "password-changed",
            MailKind::TwoFactorSetup => "two-factor-setup",
            MailKind::LoginAlert => "login-alert",
            MailKind::AccountLinked => "account-linked",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OutgoingMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub kind: MailKind,
}

impl OutgoingMail {
    pub(crate) fn password_reset(recipient: &str, username: &str, link: &str) -> Self {
        OutgoingMail {
            recipient: recipient.to_string(),
            subject: "Password reset request".to_string(),
            body: format!(
                "Hello {username},\n\nUse the link below to choose a new password. It expires in one hour.\n\n{link}\n\nIf you did not ask for this, ignore this message."
            ),
            kind: MailKind::PasswordReset,
        }
    }

    pub(crate) fn password_changed(recipient: &str, username: &str) -> Self {
        OutgoingMail {
            recipient: recipient.to_string(),
            subject: "Your password was changed".to_string(),
            body: format!(
                "Hello {username},\n\nThe password for your account was just changed and all sessions were signed out."
            ),
            kind: MailKind::PasswordChanged,
        }
    }

    pub(crate) fn two_factor_setup(recipient: &str, username: &str) -> Self {
        OutgoingMail {
            recipient: recipient.to_string(),
            subject: "Two-factor authentication setup started".to_string(),
            body: format!(
                "Hello {username},\n\nTwo-factor authentication setup was started for your account. Keep your backup codes somewhere safe."
            ),
            kind: MailKind::TwoFactorSetup,
        }
    }

    pub(crate) fn login_alert(recipient: &str, username: &str, ip: &str, user_agent: &str) -> Self {
        OutgoingMail {
            recipient: recipient.to_string(),
            subject: "New sign-in to your account".to_string(),
            body: format!(
                "Hello {username},\n\nA new sign-in was recorded.\n\nIP address: {ip}\nDevice: {user_agent}"
            ),
            kind: MailKind::LoginAlert,
        }
    }

    pub(crate) fn account_linked(recipient: &str, username: &str, provider: &str) -> Self {
        OutgoingMail {
            recipient: recipient.to_string(),
            subject: format!("{provider} account linked"),
            body: format!(
                "Hello {username},\n\nA {provider} account was linked to your dealership account."
            ),
            kind: MailKind::AccountLinked,
        }
    }
}

pub(crate) async fn queue_mail(
    pool: &SqlitePool,
    mail: &OutgoingMail,
    now: i64,
) -> Result<i64, sqlx::Error> {
    let res = sqlx::query(
        "INSERT INTO email_outbox (recipient, subject, body, kind, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&mail.recipient)
    .bind(&mail.subject)
    .bind(&mail.body)
    .bind(mail.kind.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    log_message(&format!(
        "info mail-queued kind={} to={} id={}",
        mail.kind.as_str(),
        mail.recipient,
        res.last_insert_rowid()
    ));
    if let Some(path) = config().mail_snapshot.as_deref() {
        append_snapshot(path, mail);
    }
    Ok(res.last_insert_rowid())
}

fn append_snapshot(path: &Path, mail: &OutgoingMail) {
    let line = json!({
        "to": mail.recipient,
        "subject": mail.subject,
        "body": mail.body,
        "kind": mail.kind.as_str(),
    });
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(err) = result {
        log_message(&format!(
            "warn mail-snapshot-failed path={} err={err}",
            path.display()
        ));
    }
}
