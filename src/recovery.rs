use sqlx::{Row, SqlitePool};

use crate::session::{random_hex, revoke_all_for_user, sha256_hex};
use crate::users::set_password_hash;

pub(crate) const RESET_TOKEN_TTL_SECS: i64 = 3_600;
const RESET_TOKEN_BYTES: usize = 32;

pub(crate) async fn create_reset_token(
    pool: &SqlitePool,
    user_id: i64,
    now: i64,
) -> Result<String, sqlx::Error> {
    let token = random_hex(RESET_TOKEN_BYTES);
    sqlx::query(
        "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(sha256_hex(&token))
    .bind(now + RESET_TOKEN_TTL_SECS)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(token)
}

/// Owner of an unused, unexpired token.
pub(crate) async fn reset_token_owner(
    pool: &SqlitePool,
    token: &str,
    now: i64,
) -> Result<Option<i64>, sqlx::Error> {
    if token.trim().is_empty() {
        return Ok(None);
    }
    let row = sqlx::query(
        "SELECT user_id FROM password_reset_tokens WHERE token_hash = ? AND expires_at > ? AND used_at IS NULL",
    )
    .bind(sha256_hex(token.trim()))
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("user_id")))
}

/// Sets the new hash, burns the token and revokes every refresh token in
/// one transaction. `None` when the token is not usable.
pub(crate) async fn complete_reset(
    pool: &SqlitePool,
    token: &str,
    new_hash: &str,
    now: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let digest = sha256_hex(token.trim());
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        "UPDATE password_reset_tokens SET used_at = ? WHERE token_hash = ? AND expires_at > ? AND used_at IS NULL RETURNING user_id",
    )
    .bind(now)
    .bind(&digest)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = claimed else {
        tx.rollback().await?;
        return Ok(None);
    };
    let user_id: i64 = row.get("user_id");

    set_password_hash(&mut *tx, user_id, new_hash, now).await?;
    revoke_all_for_user(&mut *tx, user_id, now as u64).await?;
    tx.commit().await?;
    Ok(Some(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{create_refresh_token, lookup_refresh_token};
    use crate::users::{create_user, find_by_id};

    #[tokio::test]
    async fn reset_is_single_use_and_revokes_sessions() {
        let pool = crate::db::test_pool().await;
        let uid = create_user(&pool, "henry", "henry@example.com", Some("old"), "user", 1)
            .await
            .unwrap();
        let refresh = create_refresh_token(&pool, uid, 100).await.unwrap();
        let token = create_reset_token(&pool, uid, 100).await.unwrap();
        assert_eq!(token.len(), RESET_TOKEN_BYTES * 2);

        assert_eq!(reset_token_owner(&pool, &token, 101).await.unwrap(), Some(uid));
        assert_eq!(complete_reset(&pool, &token, "new-hash", 102).await.unwrap(), Some(uid));

        let user = find_by_id(&pool, uid).await.unwrap().unwrap();
        assert_eq!(user.password_hash.as_deref(), Some("new-hash"));
        assert!(lookup_refresh_token(&pool, &refresh, 103).await.unwrap().is_none());

        assert_eq!(reset_token_owner(&pool, &token, 103).await.unwrap(), None);
        assert_eq!(complete_reset(&pool, &token, "again", 104).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_and_unknown_tokens_are_rejected() {
        let pool = crate::db::test_pool().await;
        let uid = create_user(&pool, "iris", "iris@example.com", Some("old"), "user", 1)
            .await
            .unwrap();
        let token = create_reset_token(&pool, uid, 100).await.unwrap();
        let expiry = 100 + RESET_TOKEN_TTL_SECS;

        assert_eq!(reset_token_owner(&pool, &token, expiry).await.unwrap(), None);
        assert_eq!(complete_reset(&pool, &token, "x", expiry).await.unwrap(), None);
        assert_eq!(reset_token_owner(&pool, "", 100).await.unwrap(), None);
        assert_eq!(reset_token_owner(&pool, "deadbeef", 100).await.unwrap(), None);

        let user = find_by_id(&pool, uid).await.unwrap().unwrap();
        assert_eq!(user.password_hash.as_deref(), Some("old"));
    }
}
