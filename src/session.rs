//! Access tokens (HS256 JWTs) and opaque, revocable refresh tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::audit::current_unix_secs;
use crate::config::config;
use crate::db::with_db;
use crate::http::{RequestContext, respond_error, respond_internal_error, respond_json};
use crate::users::{self, User};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const ACCESS_TOKEN_TTL_SECS: u64 = 24 * 3_600;
pub(crate) const REFRESH_TOKEN_TTL_SECS: u64 = 7 * 24 * 3_600;
const REFRESH_TOKEN_BYTES: usize = 40;
const TOKEN_TYPE_ACCESS: &str = "access";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub iat: u64,
    pub exp: u64,
    pub typ: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenError {
    Malformed,
    Algorithm,
    Signature,
    Expired,
    WrongType,
}

impl TokenError {
    pub(crate) fn code(self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::Algorithm => "unsupported-alg",
            TokenError::Signature => "bad-signature",
            TokenError::Expired => "expired",
            TokenError::WrongType => "wrong-type",
        }
    }
}

#[derive(Deserialize)]
struct JwtHeader {
    alg: String,
}

fn sign(secret: &str, signing_input: &str) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| e.to_string())?;
    mac.update(signing_input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn issue_access_token(secret: &str, user: &User, now: u64) -> Result<String, String> {
    let claims = Claims {
        id: user.id,
        username: user.username.clone(),
        role: user.role.clone(),
        iat: now,
        exp: now + ACCESS_TOKEN_TTL_SECS,
        typ: TOKEN_TYPE_ACCESS.to_string(),
    };
    encode_jwt(secret, &claims)
}

fn encode_jwt(secret: &str, claims: &Claims) -> Result<String, String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(|e| e.to_string())?);
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, &signing_input)?);
    Ok(format!("{signing_input}.{signature}"))
}

pub(crate) fn verify_access_token(secret: &str, token: &str, now: u64) -> Result<Claims, TokenError> {
    let mut parts = token.trim().split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let header_raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TokenError::Malformed)?;
    let header: JwtHeader = serde_json::from_slice(&header_raw).map_err(|_| TokenError::Malformed)?;
    if header.alg != "HS256" {
        return Err(TokenError::Algorithm);
    }

    let provided = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| TokenError::Signature)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| TokenError::Signature)?;

    let payload_raw = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&payload_raw).map_err(|_| TokenError::Malformed)?;
    if claims.typ != TOKEN_TYPE_ACCESS {
        return Err(TokenError::WrongType);
    }
    if claims.exp <= now {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Digest stored in place of refresh, reset and backup secrets.
pub(crate) fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

pub(crate) async fn create_refresh_token(
    pool: &SqlitePool,
    user_id: i64,
    now: u64,
) -> Result<String, sqlx::Error> {
    let token = random_hex(REFRESH_TOKEN_BYTES);
    sqlx::query("INSERT INTO refresh_tokens (user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?)")
        .bind(user_id)
        .bind(sha256_hex(&token))
        .bind((now + REFRESH_TOKEN_TTL_SECS) as i64)
        .bind(now as i64)
        .execute(pool)
        .await?;
    Ok(token)
}

/// Returns the owner of a live refresh token.
pub(crate) async fn lookup_refresh_token(
    pool: &SqlitePool,
    token: &str,
    now: u64,
) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT user_id FROM refresh_tokens WHERE token_hash = ? AND expires_at > ? AND revoked_at IS NULL",
    )
    .bind(sha256_hex(token))
    .bind(now as i64)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let user = users::find_by_id(pool, row.get::<i64, _>("user_id")).await?;
    Ok(user.filter(|u| u.is_active))
}

pub(crate) async fn revoke_refresh_token(
    pool: &SqlitePool,
    token: &str,
    now: u64,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        "UPDATE refresh_tokens SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
    )
    .bind(now as i64)
    .bind(sha256_hex(token))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub(crate) async fn revoke_all_for_user<'e, E>(
    executor: E,
    user_id: i64,
    now: u64,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let res = sqlx::query(
        "UPDATE refresh_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
    )
    .bind(now as i64)
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected())
}

/// Resolves the bearer token to an active user, answering 401/500 itself
/// when that is not possible.
pub(crate) fn require_user(ctx: &RequestContext, action: &str) -> Result<Option<User>, String> {
    let Some(token) = ctx.bearer_token() else {
        respond_error(ctx, 401, "No token provided", action)?;
        return Ok(None);
    };
    authenticate_token(ctx, &token, action)
}

pub(crate) fn authenticate_token(
    ctx: &RequestContext,
    token: &str,
    action: &str,
) -> Result<Option<User>, String> {
    let Some(secret) = config().jwt_secret.clone() else {
        respond_internal_error(ctx, action, "jwt secret not configured")?;
        return Ok(None);
    };

    let claims = match verify_access_token(&secret, token, current_unix_secs()) {
        Ok(claims) => claims,
        Err(err) => {
            respond_json(
                ctx,
                401,
                &json!({ "error": "Invalid token" }),
                action,
                Some(json!({ "reason": err.code() })),
            )?;
            return Ok(None);
        }
    };

    let user_id = claims.id;
    let user = match with_db(move |pool| async move { users::find_by_id(&pool, user_id).await }) {
        Ok(user) => user,
        Err(err) => {
            respond_internal_error(ctx, action, &err)?;
            return Ok(None);
        }
    };

    match user.filter(|u| u.is_active) {
        Some(user) => Ok(Some(user)),
        None => {
            respond_error(ctx, 401, "Invalid token", action)?;
            Ok(None)
        }
    }
}

pub(crate) fn require_admin(ctx: &RequestContext, action: &str) -> Result<Option<User>, String> {
    let Some(user) = require_user(ctx, action)? else {
        return Ok(None);
    };
    if !user.is_admin() {
        respond_error(ctx, 403, "Admin access required", action)?;
        return Ok(None);
    }
    Ok(Some(user))
}
