//! Google sign-in: consent redirect, signed `state`, code exchange and
//! account resolution (login, link, or create).

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use sqlx::SqlitePool;
use std::env;
use std::time::Duration;
use subtle::ConstantTimeEq;
use url::Url;

use crate::audit::{current_unix_secs, log_message};
use crate::auth::issue_session;
use crate::config::{ENV_GOOGLE_MOCK_PROFILE, Profile, config};
use crate::db::{runtime, with_db};
use crate::http::{
    RequestContext, respond_error, respond_internal_error, respond_json, respond_redirect,
};
use crate::mailer::{OutgoingMail, queue_mail};
use crate::session::{authenticate_token, random_hex, require_user};
use crate::users::{self, User};

type HmacSha256 = Hmac<Sha256>;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const STATE_TTL_SECS: u64 = 600;
const MAX_USERNAME_BASE: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GoogleError {
    NotConfigured,
    StateInvalid,
    StateExpired,
    MissingCode,
    Denied,
    Exchange,
    Timeout,
    Profile,
    AlreadyLinked,
    AccountDisabled,
    Db(String),
}

impl GoogleError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            GoogleError::NotConfigured => "google_not_configured",
            GoogleError::StateInvalid => "invalid_state",
            GoogleError::StateExpired => "state_expired",
            GoogleError::MissingCode => "missing_code",
            GoogleError::Denied => "access_denied",
            GoogleError::Exchange => "token_exchange_failed",
            GoogleError::Timeout => "google_timeout",
            GoogleError::Profile => "profile_fetch_failed",
            GoogleError::AlreadyLinked => "google_account_in_use",
            GoogleError::AccountDisabled => "account_disabled",
            GoogleError::Db(_) => "server_error",
        }
    }
}

impl From<sqlx::Error> for GoogleError {
    fn from(err: sqlx::Error) -> Self {
        GoogleError::Db(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GoogleProfile {
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
}

impl GoogleProfile {
    fn as_json(&self) -> Value {
        json!({
            "sub": self.sub,
            "email": self.email,
            "name": self.name,
            "picture": self.picture,
            "email_verified": self.email_verified,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct OAuthState {
    pub issued_at: u64,
    pub link_user_id: Option<i64>,
}

fn state_mac(secret: &str, payload: &str) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| e.to_string())?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn sign_state(secret: &str, link_user_id: Option<i64>, now: u64) -> Result<String, String> {
    let payload = format!("{}.{now}.{}", random_hex(16), link_user_id.unwrap_or(0));
    let mac = state_mac(secret, &payload)?;
    Ok(format!("{payload}.{mac}"))
}

pub(crate) fn verify_state(secret: &str, state: &str, now: u64) -> Result<OAuthState, GoogleError> {
    let parts: Vec<&str> = state.trim().split('.').collect();
    let [nonce, issued_raw, link_raw, provided] = parts.as_slice() else {
        return Err(GoogleError::StateInvalid);
    };
    let payload = format!("{nonce}.{issued_raw}.{link_raw}");
    let expected = state_mac(secret, &payload).map_err(|_| GoogleError::StateInvalid)?;
    if !bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        return Err(GoogleError::StateInvalid);
    }

    let issued_at: u64 = issued_raw.parse().map_err(|_| GoogleError::StateInvalid)?;
    let link_user_id: i64 = link_raw.parse().map_err(|_| GoogleError::StateInvalid)?;
    if now.saturating_sub(issued_at) > STATE_TTL_SECS {
        return Err(GoogleError::StateExpired);
    }
    Ok(OAuthState {
        issued_at,
        link_user_id: (link_user_id > 0).then_some(link_user_id),
    })
}

fn mock_profile_raw() -> Option<String> {
    if config().profile != Profile::Test {
        return None;
    }
    env::var(ENV_GOOGLE_MOCK_PROFILE)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn google_available() -> bool {
    config().google_configured() || mock_profile_raw().is_some()
}

pub(crate) fn consent_url(state: &str) -> Result<String, String> {
    let cfg = config();
    let mut url = Url::parse(AUTH_ENDPOINT).map_err(|e| e.to_string())?;
    url.query_pairs_mut()
        .append_pair("client_id", cfg.google_client_id.as_deref().unwrap_or_default())
        .append_pair("redirect_uri", &cfg.google_redirect_uri())
        .append_pair("response_type", "code")
        .append_pair("scope", "openid email profile")
        .append_pair("access_type", "online")
        .append_pair("prompt", "select_account")
        .append_pair("state", state);
    Ok(url.into())
}

fn frontend_callback(pairs: &[(&str, &str)]) -> String {
    let base = format!("{}/auth/callback", config().frontend_url);
    match Url::parse(&base) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(pairs.iter().copied());
            url.into()
        }
        Err(_) => base,
    }
}

fn mock_profile(raw: &str) -> Result<GoogleProfile, GoogleError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| GoogleError::Profile)?;
    if let Some(code) = value.get("error").and_then(|v| v.as_str()) {
        return Err(match code.trim() {
            "timeout" => GoogleError::Timeout,
            "exchange" => GoogleError::Exchange,
            "denied" => GoogleError::Denied,
            _ => GoogleError::Profile,
        });
    }
    serde_json::from_value(value).map_err(|_| GoogleError::Profile)
}

fn map_reqwest_error(err: reqwest::Error) -> GoogleError {
    if err.is_timeout() {
        return GoogleError::Timeout;
    }
    GoogleError::Exchange
}

fn google_http_client() -> Result<Client, reqwest::Error> {
    Client::builder().timeout(Duration::from_secs(10)).build()
}

async fn fetch_profile(code: &str) -> Result<GoogleProfile, GoogleError> {
    if let Some(raw) = mock_profile_raw() {
        return mock_profile(&raw);
    }

    let cfg = config();
    let (Some(client_id), Some(client_secret)) =
        (cfg.google_client_id.as_deref(), cfg.google_client_secret.as_deref())
    else {
        return Err(GoogleError::NotConfigured);
    };

    let client = google_http_client().map_err(map_reqwest_error)?;
    let redirect_uri = cfg.google_redirect_uri();
    let response = client
        .post(TOKEN_ENDPOINT)
        .form(&[
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .map_err(map_reqwest_error)?;
    if !response.status().is_success() {
        log_message(&format!(
            "warn google-token-exchange status={}",
            response.status().as_u16()
        ));
        return Err(GoogleError::Exchange);
    }
    let tokens: TokenResponse = response.json().await.map_err(|_| GoogleError::Exchange)?;

    let response = client
        .get(USERINFO_ENDPOINT)
        .bearer_auth(&tokens.access_token)
        .send()
        .await
        .map_err(map_reqwest_error)?;
    if !response.status().is_success() {
        return Err(GoogleError::Profile);
    }
    let profile: GoogleProfile = response.json().await.map_err(|_| GoogleError::Profile)?;
    if profile.sub.trim().is_empty() {
        return Err(GoogleError::Profile);
    }
    Ok(profile)
}

fn sanitize_username_base(profile: &GoogleProfile) -> String {
    let source = profile
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| profile.email.split('@').next().unwrap_or_default());
    let mut base: String = source
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => Some(c.to_ascii_lowercase()),
            ' ' | '.' => Some('_'),
            _ => None,
        })
        .take(MAX_USERNAME_BASE)
        .collect();
    if base.len() < 3 {
        base = format!("user_{base}");
    }
    base
}

async fn unique_username(pool: &SqlitePool, base: &str) -> Result<String, sqlx::Error> {
    if !users::username_taken(pool, base).await? {
        return Ok(base.to_string());
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{base}{suffix}");
        if !users::username_taken(pool, &candidate).await? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

#[derive(Debug)]
pub(crate) struct Resolution {
    pub user: User,
    pub newly_linked: bool,
    pub created: bool,
}

/// Maps a Google profile onto a local account.
pub(crate) async fn resolve_account(
    pool: &SqlitePool,
    profile: &GoogleProfile,
    link_user_id: Option<i64>,
    default_role: &str,
    now: i64,
) -> Result<Resolution, GoogleError> {
    let owner = users::find_by_google_id(pool, &profile.sub).await?;

    if let Some(target_id) = link_user_id {
        let target = users::find_by_id(pool, target_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or(GoogleError::AccountDisabled)?;
        if let Some(owner) = owner {
            if owner.id != target.id {
                return Err(GoogleError::AlreadyLinked);
            }
            return Ok(Resolution { user: owner, newly_linked: false, created: false });
        }
        // A second Google identity never replaces the first; unlink first.
        if target.google_id.is_some() {
            return Err(GoogleError::AlreadyLinked);
        }
        users::link_google(pool, target.id, &profile.sub, &profile.as_json(), now).await?;
        let user = users::find_by_id(pool, target.id).await?.ok_or(GoogleError::Profile)?;
        return Ok(Resolution { user, newly_linked: true, created: false });
    }

    if let Some(user) = owner {
        if !user.is_active {
            return Err(GoogleError::AccountDisabled);
        }
        return Ok(Resolution { user, newly_linked: false, created: false });
    }

    if !profile.email.trim().is_empty() {
        if let Some(existing) = users::find_by_email(pool, &profile.email).await? {
            if !existing.is_active {
                return Err(GoogleError::AccountDisabled);
            }
            if existing.google_id.is_some() {
                return Err(GoogleError::AlreadyLinked);
            }
            users::link_google(pool, existing.id, &profile.sub, &profile.as_json(), now).await?;
            let user = users::find_by_id(pool, existing.id)
                .await?
                .ok_or(GoogleError::Profile)?;
            return Ok(Resolution { user, newly_linked: true, created: false });
        }
    }

    if profile.email.trim().is_empty() {
        return Err(GoogleError::Profile);
    }
    let username = unique_username(pool, &sanitize_username_base(profile)).await?;
    let id = users::create_user(pool, &username, profile.email.trim(), None, default_role, now).await?;
    users::link_google(pool, id, &profile.sub, &profile.as_json(), now).await?;
    let user = users::find_by_id(pool, id).await?.ok_or(GoogleError::Profile)?;
    Ok(Resolution { user, newly_linked: false, created: true })
}

pub(crate) fn handle_google_route(ctx: &RequestContext, route: &str) -> Result<(), String> {
    if ctx.method != "GET" {
        return respond_error(ctx, 405, "Method not allowed", "google-auth");
    }
    match route {
        "/api/auth/google" => handle_google_start(ctx, None, "google-start"),
        "/api/auth/google/link" => handle_google_link(ctx),
        "/api/auth/google/callback" => handle_google_callback(ctx),
        _ => respond_error(ctx, 404, "Not found", "google-auth"),
    }
}

fn handle_google_start(
    ctx: &RequestContext,
    link_user_id: Option<i64>,
    action: &str,
) -> Result<(), String> {
    if !google_available() {
        return respond_error(ctx, 503, "Google login is not configured", action);
    }
    let Some(secret) = config().jwt_secret.clone() else {
        return respond_internal_error(ctx, action, "jwt secret not configured");
    };
    let state = sign_state(&secret, link_user_id, current_unix_secs())?;
    let location = consent_url(&state)?;
    respond_redirect(
        ctx,
        &location,
        action,
        Some(json!({ "link_user_id": link_user_id })),
    )
}

fn handle_google_link(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "google-link";
    let token = ctx
        .query_param("token")
        .or_else(|| ctx.bearer_token());
    let Some(token) = token else {
        return respond_error(ctx, 401, "No token provided", ACTION);
    };
    let Some(user) = authenticate_token(ctx, &token, ACTION)? else {
        return Ok(());
    };
    handle_google_start(ctx, Some(user.id), ACTION)
}

fn redirect_failure(ctx: &RequestContext, err: &GoogleError) -> Result<(), String> {
    if let GoogleError::Db(detail) = err {
        log_message(&format!("warn google-callback-db err={detail}"));
    }
    let location = frontend_callback(&[("error", err.code())]);
    respond_redirect(
        ctx,
        &location,
        "google-callback",
        Some(json!({ "error": err.code() })),
    )
}

fn handle_google_callback(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "google-callback";
    if ctx.query_param("error").is_some() {
        return redirect_failure(ctx, &GoogleError::Denied);
    }
    let Some(secret) = config().jwt_secret.clone() else {
        return respond_internal_error(ctx, ACTION, "jwt secret not configured");
    };
    let state = match verify_state(
        &secret,
        &ctx.query_param("state").unwrap_or_default(),
        current_unix_secs(),
    ) {
        Ok(state) => state,
        Err(err) => return redirect_failure(ctx, &err),
    };
    let Some(code) = ctx.query_param("code") else {
        return redirect_failure(ctx, &GoogleError::MissingCode);
    };

    let profile = match runtime().block_on(fetch_profile(&code)) {
        Ok(profile) => profile,
        Err(err) => return redirect_failure(ctx, &err),
    };

    let link_user_id = state.link_user_id;
    let state_age = current_unix_secs().saturating_sub(state.issued_at);
    let default_role = config().google_default_role.clone();
    let now = current_unix_secs() as i64;
    let resolved = with_db(move |pool| async move {
        let outcome = resolve_account(&pool, &profile, link_user_id, &default_role, now).await;
        if let Ok(resolution) = &outcome {
            if resolution.newly_linked {
                let user = &resolution.user;
                let mail = OutgoingMail::account_linked(&user.email, &user.username, "Google");
                if let Err(err) = queue_mail(&pool, &mail, now).await {
                    log_message(&format!("warn link-mail-queue-failed user={} err={err}", user.id));
                }
            }
        }
        Ok(outcome)
    });

    let resolution = match resolved {
        Ok(Ok(resolution)) => resolution,
        Ok(Err(GoogleError::AlreadyLinked)) if link_user_id.is_some() => {
            return respond_json(
                ctx,
                409,
                &json!({ "error": "Google account is already linked to another user" }),
                ACTION,
                Some(json!({ "link_user_id": link_user_id })),
            );
        }
        Ok(Err(err)) => return redirect_failure(ctx, &err),
        Err(err) => return redirect_failure(ctx, &GoogleError::Db(err)),
    };

    let (token, refresh_token) = match issue_session(&resolution.user) {
        Ok(pair) => pair,
        Err(err) => return redirect_failure(ctx, &GoogleError::Db(err)),
    };
    let location = frontend_callback(&[("token", &token), ("refreshToken", &refresh_token)]);
    respond_redirect(
        ctx,
        &location,
        ACTION,
        Some(json!({
            "user_id": resolution.user.id,
            "created": resolution.created,
            "linked": resolution.newly_linked,
            "state_age": state_age,
        })),
    )
}

pub(crate) fn handle_unlink(ctx: &RequestContext) -> Result<(), String> {
    const ACTION: &str = "google-unlink";
    let Some(user) = require_user(ctx, ACTION)? else {
        return Ok(());
    };
    if user.password_hash.is_none() {
        return respond_error(
            ctx,
            400,
            "Cannot unlink Google account without a password set",
            ACTION,
        );
    }
    let user_id = user.id;
    let now = current_unix_secs() as i64;
    if let Err(err) = with_db(move |pool| async move { users::unlink_google(&pool, user_id, now).await }) {
        return respond_internal_error(ctx, ACTION, &err);
    }
    respond_json(
        ctx,
        200,
        &json!({ "message": "Google account unlinked successfully" }),
        ACTION,
        Some(json!({ "user_id": user_id })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    const SECRET: &str = "state-secret";

    fn profile(sub: &str, email: &str, name: Option<&str>) -> GoogleProfile {
        GoogleProfile {
            sub: sub.into(),
            email: email.into(),
            name: name.map(str::to_string),
            picture: None,
            email_verified: Some(true),
        }
    }

    #[test]
    fn state_round_trip_binds_link_target() {
        let state = sign_state(SECRET, Some(42), 1_000).unwrap();
        assert_eq!(
            verify_state(SECRET, &state, 1_100).unwrap(),
            OAuthState { issued_at: 1_000, link_user_id: Some(42) }
        );

        let login_state = sign_state(SECRET, None, 1_000).unwrap();
        assert_eq!(verify_state(SECRET, &login_state, 1_000).unwrap().link_user_id, None);
    }

    #[test]
    fn state_rejects_tampering_and_age() {
        let state = sign_state(SECRET, Some(1), 1_000).unwrap();
        assert_eq!(
            verify_state(SECRET, &state, 1_000 + STATE_TTL_SECS + 1),
            Err(GoogleError::StateExpired)
        );
        assert_eq!(verify_state("other", &state, 1_000), Err(GoogleError::StateInvalid));

        let mut parts: Vec<String> = state.split('.').map(str::to_string).collect();
        parts[2] = "2".into();
        assert_eq!(
            verify_state(SECRET, &parts.join("."), 1_000),
            Err(GoogleError::StateInvalid)
        );
        assert_eq!(verify_state(SECRET, "", 1_000), Err(GoogleError::StateInvalid));
    }

    #[test]
    fn mock_profile_maps_errors() {
        assert_eq!(
            mock_profile(r#"{"error":"timeout"}"#).unwrap_err(),
            GoogleError::Timeout
        );
        let parsed = mock_profile(r#"{"sub":"g-1","email":"a@b.example","name":"A B"}"#).unwrap();
        assert_eq!(parsed.sub, "g-1");
        assert_eq!(mock_profile("not json").unwrap_err(), GoogleError::Profile);
    }

    #[test]
    fn username_base_is_sanitized() {
        assert_eq!(
            sanitize_username_base(&profile("1", "x@y.z", Some("Jane Q. Public!"))),
            "jane_q__public"
        );
        assert_eq!(sanitize_username_base(&profile("1", "jo@y.z", None)), "user_jo");
    }

    #[tokio::test]
    async fn login_mode_creates_then_reuses_account() {
        let pool = test_pool().await;
        let google = profile("g-100", "new@dealer.example", Some("New Person"));

        let first = resolve_account(&pool, &google, None, "user", 10).await.unwrap();
        assert!(first.created);
        assert_eq!(first.user.username, "new_person");
        assert_eq!(first.user.role, "user");
        assert!(first.user.password_hash.is_none());

        let second = resolve_account(&pool, &google, None, "user", 11).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.user.id, first.user.id);
    }

    #[tokio::test]
    async fn login_mode_links_by_email_and_dedupes_usernames() {
        let pool = test_pool().await;
        let existing = users::create_user(&pool, "new_person", "owner@dealer.example", Some("h"), "admin", 1)
            .await
            .unwrap();

        let by_email = resolve_account(
            &pool,
            &profile("g-200", "OWNER@dealer.example", Some("Owner")),
            None,
            "user",
            5,
        )
        .await
        .unwrap();
        assert_eq!(by_email.user.id, existing);
        assert!(by_email.newly_linked);

        let fresh = resolve_account(
            &pool,
            &profile("g-201", "other@dealer.example", Some("New Person")),
            None,
            "user",
            6,
        )
        .await
        .unwrap();
        assert_eq!(fresh.user.username, "new_person1");
    }

    #[tokio::test]
    async fn link_mode_conflicts_with_other_owner() {
        let pool = test_pool().await;
        let a = users::create_user(&pool, "aaa", "a@dealer.example", Some("h"), "user", 1)
            .await
            .unwrap();
        let b = users::create_user(&pool, "bbb", "b@dealer.example", Some("h"), "user", 1)
            .await
            .unwrap();
        let google = profile("g-300", "someone@gmail.example", None);

        let linked = resolve_account(&pool, &google, Some(a), "user", 2).await.unwrap();
        assert!(linked.newly_linked);
        assert_eq!(linked.user.google_id.as_deref(), Some("g-300"));

        let err = resolve_account(&pool, &google, Some(b), "user", 3).await.unwrap_err();
        assert_eq!(err, GoogleError::AlreadyLinked);
        assert_eq!(err.code(), "google_account_in_use");
    }

    #[tokio::test]
    async fn link_mode_keeps_existing_google_identity() {
        let pool = test_pool().await;
        let a = users::create_user(&pool, "ccc", "c@dealer.example", Some("h"), "user", 1)
            .await
            .unwrap();
        let first = profile("g-400", "c@gmail.example", None);
        resolve_account(&pool, &first, Some(a), "user", 2).await.unwrap();

        let second = profile("g-401", "c2@gmail.example", None);
        let err = resolve_account(&pool, &second, Some(a), "user", 3).await.unwrap_err();
        assert_eq!(err, GoogleError::AlreadyLinked);

        let stored = users::find_by_id(&pool, a).await.unwrap().unwrap();
        assert_eq!(stored.google_id.as_deref(), Some("g-400"));
        assert!(users::find_by_google_id(&pool, "g-401").await.unwrap().is_none());
    }
}
