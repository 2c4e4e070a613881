use sqlx::SqlitePool;

pub(crate) const HISTORY_RETENTION_SECS: i64 = 30 * 86_400;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PruneReport {
    pub refresh_tokens: u64,
    pub reset_tokens: u64,
    pub login_attempts: u64,
    pub rate_limit_tokens: u64,
}

async fn prune_where(
    pool: &SqlitePool,
    table: &str,
    predicate: &str,
    binds: &[i64],
    dry_run: bool,
) -> Result<u64, sqlx::Error> {
    if dry_run {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE {predicate}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        return Ok(query.fetch_one(pool).await? as u64);
    }
    let sql = format!("DELETE FROM {table} WHERE {predicate}");
    let mut query = sqlx::query(&sql);
    for value in binds {
        query = query.bind(*value);
    }
    Ok(query.execute(pool).await?.rows_affected())
}

/// Drops credentials that can never be used again plus login and
/// rate-limit history older than `retention_secs`.
pub(crate) async fn prune_stale_records(
    pool: &SqlitePool,
    now: i64,
    retention_secs: i64,
    dry_run: bool,
) -> Result<PruneReport, sqlx::Error> {
    let cutoff = now - retention_secs.max(1);
    Ok(PruneReport {
        refresh_tokens: prune_where(
            pool,
            "refresh_tokens",
            "expires_at <= ? OR revoked_at IS NOT NULL",
            &[now],
            dry_run,
        )
        .await?,
        reset_tokens: prune_where(
            pool,
            "password_reset_tokens",
            "expires_at <= ? OR used_at IS NOT NULL",
            &[now],
            dry_run,
        )
        .await?,
        login_attempts: prune_where(pool, "login_attempts", "attempted_at < ?", &[cutoff], dry_run)
            .await?,
        rate_limit_tokens: prune_where(pool, "rate_limit_tokens", "ts < ?", &[cutoff], dry_run)
            .await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::rate_limit::record_login_attempt;
    use crate::recovery::create_reset_token;
    use crate::session::{create_refresh_token, revoke_refresh_token};
    use crate::users::create_user;

    #[tokio::test]
    async fn prune_counts_then_deletes_only_stale_rows() {
        let pool = test_pool().await;
        let now = 2_000_000_000i64;
        let uid = create_user(&pool, "pruner", "p@example.com", None, "user", now)
            .await
            .unwrap();

        let live = create_refresh_token(&pool, uid, now as u64).await.unwrap();
        let revoked = create_refresh_token(&pool, uid, now as u64).await.unwrap();
        revoke_refresh_token(&pool, &revoked, now as u64).await.unwrap();
        create_refresh_token(&pool, uid, (now - 30 * 86_400) as u64).await.unwrap();

        create_reset_token(&pool, uid, now - 7_200).await.unwrap();
        create_reset_token(&pool, uid, now).await.unwrap();

        record_login_attempt(&pool, "pruner", "1.1.1.1", false, now - 40 * 86_400)
            .await
            .unwrap();
        record_login_attempt(&pool, "pruner", "1.1.1.1", true, now).await.unwrap();

        let expected = PruneReport {
            refresh_tokens: 2,
            reset_tokens: 1,
            login_attempts: 1,
            rate_limit_tokens: 0,
        };
        let preview = prune_stale_records(&pool, now, HISTORY_RETENTION_SECS, true)
            .await
            .unwrap();
        assert_eq!(preview, expected);

        let removed = prune_stale_records(&pool, now, HISTORY_RETENTION_SECS, false)
            .await
            .unwrap();
        assert_eq!(removed, expected);

        let again = prune_stale_records(&pool, now, HISTORY_RETENTION_SECS, false)
            .await
            .unwrap();
        assert_eq!(again, PruneReport::default());
        assert!(
            crate::session::lookup_refresh_token(&pool, &live, now as u64)
                .await
                .unwrap()
                .is_some()
        );
    }
}
