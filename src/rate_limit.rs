use sqlx::SqlitePool;

pub(crate) const LOGIN_FAILURE_LIMIT: i64 = 5;
pub(crate) const LOGIN_FAILURE_WINDOW_SECS: i64 = 15 * 60;
pub(crate) const RESET_REQUEST_SCOPE: &str = "password-reset";

#[derive(Clone, Debug)]
pub(crate) struct RateWindow {
    pub limit: u64,
    pub window: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RateLimitError {
    Exceeded { count: u64, limit: u64 },
    Io(String),
}

impl RateLimitError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            RateLimitError::Exceeded { .. } => "rate-limited",
            RateLimitError::Io(_) => "rate-limit-io",
        }
    }
}

impl From<sqlx::Error> for RateLimitError {
    fn from(err: sqlx::Error) -> Self {
        RateLimitError::Io(err.to_string())
    }
}

/// Sliding-window limiter over `rate_limit_tokens`. Every window is checked;
/// the first one at or over its limit rejects the request and nothing is
/// recorded. Otherwise one token is recorded when `insert_on_success`.
pub(crate) async fn apply_rate_limits(
    pool: &SqlitePool,
    scope: &str,
    bucket: &str,
    now_secs: u64,
    windows: &[RateWindow],
    insert_on_success: bool,
) -> Result<(), RateLimitError> {
    let max_window = windows.iter().map(|w| w.window).max().unwrap_or(0);
    let mut tx = pool.begin().await?;
    if max_window > 0 {
        let cutoff = now_secs.saturating_sub(max_window) as i64;
        sqlx::query("DELETE FROM rate_limit_tokens WHERE scope = ? AND bucket = ? AND ts < ?")
            .bind(scope)
            .bind(bucket)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
    }

    for window in windows {
        let cutoff = now_secs.saturating_sub(window.window) as i64;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_tokens WHERE scope = ? AND bucket = ? AND ts >= ?",
        )
        .bind(scope)
        .bind(bucket)
        .bind(cutoff)
        .fetch_one(&mut *tx)
        .await?;
        if count as u64 >= window.limit {
            tx.rollback().await?;
            return Err(RateLimitError::Exceeded {
                count: count as u64,
                limit: window.limit,
            });
        }
    }

    if insert_on_success {
        sqlx::query("INSERT INTO rate_limit_tokens (scope, bucket, ts) VALUES (?, ?, ?)")
            .bind(scope)
            .bind(bucket)
            .bind(now_secs as i64)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub(crate) async fn record_login_attempt(
    pool: &SqlitePool,
    username: &str,
    ip: &str,
    success: bool,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO login_attempts (username, ip_address, success, attempted_at) VALUES (?, ?, ?, ?)",
    )
    .bind(username)
    .bind(ip)
    .bind(success as i64)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn recent_failed_logins(
    pool: &SqlitePool,
    username: &str,
    ip: &str,
    now: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM login_attempts WHERE username = ? AND ip_address = ? AND success = 0 AND attempted_at > ?",
    )
    .bind(username)
    .bind(ip)
    .bind(now - LOGIN_FAILURE_WINDOW_SECS)
    .fetch_one(pool)
    .await
}

pub(crate) async fn login_locked_out(
    pool: &SqlitePool,
    username: &str,
    ip: &str,
    now: i64,
) -> Result<bool, sqlx::Error> {
    Ok(recent_failed_logins(pool, username, ip, now).await? >= LOGIN_FAILURE_LIMIT)
}
