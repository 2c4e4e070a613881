use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::audit::{current_unix_secs, log_message};
use crate::config::config;
use crate::db::with_db;
use crate::google;
use crate::http::{
    RequestContext, parse_json_body, respond_empty, respond_error, respond_internal_error,
    respond_json,
};
use crate::mailer::{OutgoingMail, queue_mail};
use crate::password::{check_password_strength, hash_password, verify_password};
use crate::rate_limit::{
    RESET_REQUEST_SCOPE, RateLimitError, RateWindow, apply_rate_limits, login_locked_out,
    record_login_attempt,
};
use crate::recovery::{complete_reset, create_reset_token, reset_token_owner};
use crate::session::{
    create_refresh_token, issue_access_token, lookup_refresh_token, require_user,
    revoke_all_for_user, revoke_refresh_token,
};
use crate::totp;
use crate::users::{self, User};

const RESET_REQUEST_MESSAGE: &str = "If the email exists, a reset link will be sent";
const LOCKED_OUT_MESSAGE: &str = "Too many failed login attempts. Please try again later.";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    two_factor_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    #[serde(default)]
    refresh_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    #[serde(default)]
    current_password: String,
    #[serde(default)]
    new_password: String,
}

#[derive(Deserialize)]
struct CodeRequest {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetConfirm {
    #[serde(default)]
    token: String,
    #[serde(default)]
    new_password: String,
}

pub(crate) fn handle_auth_api(ctx: &RequestContext) -> Result<(), String> {
    let route = ctx.path.trim_end_matches('/');

    if route.starts_with("/api/auth/google") {
        return google::handle_google_route(ctx, route);
    }

    match (ctx.method.as_str(), route) {
        ("POST", "/api/auth/login") => handle_login(ctx),
        ("POST", "/api/auth/refresh") => handle_refresh(ctx),
        ("POST", "/api/auth/logout") => handle_logout(ctx),
        ("GET", "/api/auth/verify") => handle_verify(ctx),
        ("GET", "/api/auth/profile") => handle_profile(ctx),
        ("POST", "/api/auth/change-password") => handle_change_password(ctx),
        ("POST", "/api/auth/2fa/setup") => handle_two_factor_setup(ctx),
        ("POST", "/api/auth/2fa/enable") => handle_two_factor_enable(ctx),
        ("POST", "/api/auth/2fa/disable") => handle_two_factor_disable(ctx),
        ("POST", "/api/auth/password/reset-request" | "/api/auth/forgot-password") => {
            handle_reset_request(ctx)
        }
        ("POST", "/api/auth/validate-reset-token") => handle_validate_reset_token(ctx),
        ("POST", "/api/auth/password/reset" | "/api/auth/reset-password") => {
            handle_reset_password(ctx)
        }
        ("POST", "/api/auth/unlink/google") => google::handle_unlink(ctx),
        _ => respond_error(ctx, 404, "Not found", "auth-api"),
    }
}

fn read_body<T: DeserializeOwned>(ctx: &RequestContext, action: &str) -> Result<Option<T>, String> {
    match parse_json_body(ctx) {
        Ok(body) => Ok(Some(body)),
        Err(err) => {
            respond_json(
                ctx,
                400,
                &json!({ "error": "Invalid request body" }),
                action,
                Some(json!({ "reason": err })),
            )?;
            Ok(None)
        }
    }
}

/// Issues the access/refresh pair handed out by password and Google login.
pub(crate) fn issue_session(user: &User) -> Result<(String, String), String> {
    let secret = config()
        .jwt_secret
        .clone()
        .ok_or_else(|| "jwt secret not configured".to_string())?;
    let now = current_unix_secs();
    let access = issue_access_token(&secret, user, now)?;
    let user_id = user.id;
    let refresh =
        with_db(move |pool| async move { create_refresh_token(&pool, user_id, now).await })?;
    Ok((access, refresh))
}

enum LoginOutcome {
    LockedOut,
    InvalidCredentials,
    TwoFactorRequired,
    InvalidTwoFactor,
    Success(User),
}

fn handle_login(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-login";
    let Some(request) = read_body::<LoginRequest>(ctx, ACTION)? else {
        return Ok(());
    };
    let username = request.username.trim().to_string();
    if username.is_empty() || request.password.is_empty() {
        return respond_error(ctx, 400, "Username and password are required", ACTION);
    }

    let ip = ctx.client_ip();
    let user_agent = ctx.user_agent();
    let now = current_unix_secs() as i64;
    let password = request.password;
    let second_factor = request
        .two_factor_token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let attempt_user = username.clone();
    let attempt_ip = ip.clone();
    let outcome = with_db(move |pool| async move {
        let username = attempt_user;
        let ip = attempt_ip;

        if login_locked_out(&pool, &username, &ip, now).await? {
            record_login_attempt(&pool, &username, &ip, false, now).await?;
            return Ok(LoginOutcome::LockedOut);
        }

        let user = users::find_by_username(&pool, &username)
            .await?
            .filter(|u| u.is_active);
        let matched = user.filter(|u| {
            u.password_hash
                .as_deref()
                .is_some_and(|hash| verify_password(&password, hash))
        });
        let Some(user) = matched else {
            record_login_attempt(&pool, &username, &ip, false, now).await?;
            return Ok(LoginOutcome::InvalidCredentials);
        };

        if user.two_factor_enabled {
            let Some(code) = second_factor else {
                return Ok(LoginOutcome::TwoFactorRequired);
            };
            let secret = user.two_factor_secret.clone().unwrap_or_default();
            if !totp::verify_second_factor(&pool, user.id, &secret, &code, now as u64).await? {
                record_login_attempt(&pool, &username, &ip, false, now).await?;
                return Ok(LoginOutcome::InvalidTwoFactor);
            }
        }

        users::touch_last_login(&pool, user.id, now).await?;
        record_login_attempt(&pool, &username, &ip, true, now).await?;
        let alert = OutgoingMail::login_alert(&user.email, &user.username, &ip, &user_agent);
        if let Err(err) = queue_mail(&pool, &alert, now).await {
            log_message(&format!("warn login-alert-queue-failed user={} err={err}", user.id));
        }
        Ok(LoginOutcome::Success(user))
    });

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => return respond_internal_error(ctx, ACTION, &err),
    };

    match outcome {
        LoginOutcome::LockedOut => {
            log_message(&format!("warn login-locked-out user={username} ip={ip}"));
            respond_json(
                ctx,
                429,
                &json!({ "error": LOCKED_OUT_MESSAGE }),
                ACTION,
                Some(json!({ "username": username, "reason": "locked-out" })),
            )
        }
        LoginOutcome::InvalidCredentials => respond_json(
            ctx,
            401,
            &json!({ "error": "Invalid credentials" }),
            ACTION,
            Some(json!({ "username": username, "reason": "credentials" })),
        ),
        LoginOutcome::TwoFactorRequired => respond_json(
            ctx,
            200,
            &json!({
                "requiresTwoFactor": true,
                "message": "Two-factor authentication code required",
            }),
            ACTION,
            Some(json!({ "username": username, "reason": "2fa-required" })),
        ),
        LoginOutcome::InvalidTwoFactor => respond_json(
            ctx,
            401,
            &json!({ "error": "Invalid 2FA code" }),
            ACTION,
            Some(json!({ "username": username, "reason": "2fa" })),
        ),
        LoginOutcome::Success(user) => {
            let (token, refresh_token) = match issue_session(&user) {
                Ok(pair) => pair,
                Err(err) => return respond_internal_error(ctx, ACTION, &err),
            };
            respond_json(
                ctx,
                200,
                &json!({
                    "token": token,
                    "refreshToken": refresh_token,
                    "user": user.summary_json(),
                }),
                ACTION,
                Some(json!({ "username": user.username, "user_id": user.id })),
            )
        }
    }
}

fn handle_refresh(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-refresh";
    let Some(request) = read_body::<RefreshRequest>(ctx, ACTION)? else {
        return Ok(());
    };
    let token = request.refresh_token.trim().to_string();
    if token.is_empty() {
        return respond_error(ctx, 401, "Invalid refresh token", ACTION);
    }

    let now = current_unix_secs();
    let owner = match with_db(move |pool| async move { lookup_refresh_token(&pool, &token, now).await })
    {
        Ok(owner) => owner,
        Err(err) => return respond_internal_error(ctx, ACTION, &err),
    };
    let Some(user) = owner else {
        return respond_error(ctx, 401, "Invalid refresh token", ACTION);
    };

    let Some(secret) = config().jwt_secret.clone() else {
        return respond_internal_error(ctx, ACTION, "jwt secret not configured");
    };
    let token = issue_access_token(&secret, &user, now)?;
    respond_json(
        ctx,
        200,
        &json!({ "token": token }),
        ACTION,
        Some(json!({ "user_id": user.id })),
    )
}

fn handle_logout(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-logout";
    let Some(request) = read_body::<RefreshRequest>(ctx, ACTION)? else {
        return Ok(());
    };
    let token = request.refresh_token.trim().to_string();
    if !token.is_empty() {
        let now = current_unix_secs();
        if let Err(err) =
            with_db(move |pool| async move { revoke_refresh_token(&pool, &token, now).await })
        {
            return respond_internal_error(ctx, ACTION, &err);
        }
    }
    respond_empty(ctx, 204, ACTION)
}

fn handle_verify(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-verify";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    respond_json(
        ctx,
        200,
        &json!({ "valid": true, "user": user.summary_json() }),
        ACTION,
        None,
    )
}

fn handle_profile(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-profile";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    respond_json(ctx, 200, &user.profile_json(), ACTION, None)
}

fn handle_change_password(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-change-password";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(request) = read_body::<ChangePasswordRequest>(ctx, ACTION)? else {
        return Ok(());
    };

    if let Some(hash) = user.password_hash.as_deref() {
        if !verify_password(&request.current_password, hash) {
            return respond_error(ctx, 401, "Current password is incorrect", ACTION);
        }
    }
    if let Err(issue) = check_password_strength(&request.new_password) {
        return respond_error(ctx, 400, issue.message(), ACTION);
    }

    let new_hash = hash_password(&request.new_password)?;
    let now = current_unix_secs() as i64;
    let user_id = user.id;
    let mail = OutgoingMail::password_changed(&user.email, &user.username);
    let result = with_db(move |pool| async move {
        let mut tx = pool.begin().await?;
        users::set_password_hash(&mut *tx, user_id, &new_hash, now).await?;
        revoke_all_for_user(&mut *tx, user_id, now as u64).await?;
        tx.commit().await?;
        if let Err(err) = queue_mail(&pool, &mail, now).await {
            log_message(&format!("warn password-mail-queue-failed user={user_id} err={err}"));
        }
        Ok(())
    });
    if let Err(err) = result {
        return respond_internal_error(ctx, ACTION, &err);
    }

    respond_json(
        ctx,
        200,
        &json!({ "message": "Password changed successfully" }),
        ACTION,
        Some(json!({ "user_id": user_id })),
    )
}

fn handle_two_factor_setup(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-2fa-setup";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    if user.two_factor_enabled {
        return respond_error(ctx, 400, "2FA already enabled", ACTION);
    }

    let secret = totp::generate_secret();
    let backup_codes = totp::generate_backup_codes();
    let otpauth_url = totp::otpauth_url(&config().totp_issuer, &user.username, &secret);

    let now = current_unix_secs() as i64;
    let user_id = user.id;
    let stored_secret = secret.clone();
    let stored_codes = backup_codes.clone();
    let mail = OutgoingMail::two_factor_setup(&user.email, &user.username);
    let result = with_db(move |pool| async move {
        users::store_two_factor_secret(&pool, user_id, &stored_secret, now).await?;
        totp::replace_backup_codes(&pool, user_id, &stored_codes, now).await?;
        if let Err(err) = queue_mail(&pool, &mail, now).await {
            log_message(&format!("warn 2fa-mail-queue-failed user={user_id} err={err}"));
        }
        Ok(())
    });
    if let Err(err) = result {
        return respond_internal_error(ctx, ACTION, &err);
    }

    respond_json(
        ctx,
        200,
        &json!({
            "secret": secret,
            "otpauthUrl": otpauth_url,
            "backupCodes": backup_codes,
        }),
        ACTION,
        Some(json!({ "user_id": user_id })),
    )
}

fn handle_two_factor_enable(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-2fa-enable";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(request) = read_body::<CodeRequest>(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(secret) = user.two_factor_secret.as_deref() else {
        return respond_error(ctx, 400, "2FA not set up", ACTION);
    };

    let now = current_unix_secs();
    if !totp::verify_code(secret, &request.token, now) {
        return respond_error(ctx, 401, "Invalid 2FA code", ACTION);
    }

    let user_id = user.id;
    if let Err(err) =
        with_db(move |pool| async move { users::enable_two_factor(&pool, user_id, now as i64).await })
    {
        return respond_internal_error(ctx, ACTION, &err);
    }
    respond_json(
        ctx,
        200,
        &json!({ "message": "2FA enabled successfully" }),
        ACTION,
        Some(json!({ "user_id": user_id })),
    )
}

fn handle_two_factor_disable(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-2fa-disable";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    let Some(request) = read_body::<CodeRequest>(ctx, ACTION)? else {
        return Ok(());
    };
    let (true, Some(secret)) = (user.two_factor_enabled, user.two_factor_secret.clone()) else {
        return respond_error(ctx, 400, "2FA not enabled", ACTION);
    };

    let now = current_unix_secs();
    let user_id = user.id;
    let code = request.token;
    let result = with_db(move |pool| async move {
        if !totp::verify_second_factor(&pool, user_id, &secret, &code, now).await? {
            return Ok(false);
        }
        users::disable_two_factor(&pool, user_id, now as i64).await?;
        Ok(true)
    });

    match result {
        Ok(true) => respond_json(
            ctx,
            200,
            &json!({ "message": "2FA disabled successfully" }),
            ACTION,
            Some(json!({ "user_id": user_id })),
        ),
        Ok(false) => respond_error(ctx, 401, "Invalid 2FA code", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_reset_request(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-reset-request";
    let Some(request) = read_body::<ResetRequest>(ctx, ACTION)? else {
        return Ok(());
    };

    let cfg = config();
    let windows = [RateWindow {
        limit: cfg.reset_limit_count,
        window: cfg.reset_limit_window,
    }];
    let ip = ctx.client_ip();
    let now = current_unix_secs();
    let email = request.email.trim().to_string();
    let frontend = cfg.frontend_url.clone();

    let result = with_db(move |pool| async move {
        match apply_rate_limits(&pool, RESET_REQUEST_SCOPE, &ip, now, &windows, true).await {
            Ok(()) => {}
            Err(RateLimitError::Exceeded { count, limit }) => {
                return Ok(Err((count, limit)));
            }
            Err(RateLimitError::Io(err)) => return Err(sqlx::Error::Protocol(err)),
        }

        if email.is_empty() {
            return Ok(Ok(false));
        }
        let Some(user) = users::find_by_email(&pool, &email).await?.filter(|u| u.is_active) else {
            return Ok(Ok(false));
        };
        let token = create_reset_token(&pool, user.id, now as i64).await?;
        let link = format!("{frontend}/reset-password?token={token}");
        let mail = OutgoingMail::password_reset(&user.email, &user.username, &link);
        queue_mail(&pool, &mail, now as i64).await?;
        Ok(Ok(true))
    });

    match result {
        Ok(Ok(issued)) => respond_json(
            ctx,
            200,
            &json!({ "message": RESET_REQUEST_MESSAGE }),
            ACTION,
            Some(json!({ "issued": issued })),
        ),
        Ok(Err((count, limit))) => respond_json(
            ctx,
            429,
            &json!({ "error": "Too many password reset requests. Please try again later." }),
            ACTION,
            Some(json!({ "count": count, "limit": limit })),
        ),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_validate_reset_token(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-validate-reset-token";
    let Some(request) = read_body::<CodeRequest>(ctx, ACTION)? else {
        return Ok(());
    };
    let now = current_unix_secs() as i64;
    let token = request.token;
    match with_db(move |pool| async move { reset_token_owner(&pool, &token, now).await }) {
        Ok(owner) => respond_json(ctx, 200, &json!({ "valid": owner.is_some() }), ACTION, None),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}

fn handle_reset_password(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "auth-reset-password";
    let Some(request) = read_body::<ResetConfirm>(ctx, ACTION)? else {
        return Ok(());
    };
    if request.token.trim().is_empty() {
        return respond_error(ctx, 400, "Invalid or expired token", ACTION);
    }
    if let Err(issue) = check_password_strength(&request.new_password) {
        return respond_error(ctx, 400, issue.message(), ACTION);
    }

    let new_hash = hash_password(&request.new_password)?;
    let now = current_unix_secs() as i64;
    let token = request.token;
    let result = with_db(move |pool| async move {
        let Some(user_id) = complete_reset(&pool, &token, &new_hash, now).await? else {
            return Ok(None);
        };
        if let Some(user) = users::find_by_id(&pool, user_id).await? {
            let mail = OutgoingMail::password_changed(&user.email, &user.username);
            if let Err(err) = queue_mail(&pool, &mail, now).await {
                log_message(&format!("warn reset-mail-queue-failed user={user_id} err={err}"));
            }
        }
        Ok(Some(user_id))
    });

    match result {
        Ok(Some(user_id)) => respond_json(
            ctx,
            200,
            &json!({ "message": "Password has been reset successfully" }),
            ACTION,
            Some(json!({ "user_id": user_id })),
        ),
        Ok(None) => respond_error(ctx, 400, "Invalid or expired token", ACTION),
        Err(err) => respond_internal_error(ctx, ACTION, &err),
    }
}
