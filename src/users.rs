use serde_json::{Value, json};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

const USER_COLUMNS: &str = "id, username, email, password_hash, role, is_active, two_factor_secret, two_factor_enabled, google_id, last_login, created_at";

#[derive(Debug, Clone)]
pub(crate) struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub two_factor_secret: Option<String>,
    pub two_factor_enabled: bool,
    pub google_id: Option<String>,
    pub last_login: Option<i64>,
    pub created_at: i64,
}

impl User {
    fn from_row(row: &SqliteRow) -> Self {
        User {
            id: row.get("id"),
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            role: row.get("role"),
            is_active: row.get::<i64, _>("is_active") != 0,
            two_factor_secret: row.get("two_factor_secret"),
            two_factor_enabled: row.get::<i64, _>("two_factor_enabled") != 0,
            google_id: row.get("google_id"),
            last_login: row.get("last_login"),
            created_at: row.get("created_at"),
        }
    }

    pub(crate) fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    /// Shape returned by login and verify.
    pub(crate) fn summary_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "role": self.role,
            "twoFactorEnabled": self.two_factor_enabled,
        })
    }

    pub(crate) fn profile_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "role": self.role,
            "twoFactorEnabled": self.two_factor_enabled,
            "googleLinked": self.google_id.is_some(),
            "hasPassword": self.password_hash.is_some(),
            "lastLogin": self.last_login,
            "createdAt": self.created_at,
        })
    }
}

async fn find_one(pool: &SqlitePool, column: &str, value: &str) -> Result<Option<User>, sqlx::Error> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?");
    let row = sqlx::query(&sql).bind(value).fetch_optional(pool).await?;
    Ok(row.as_ref().map(User::from_row))
}

pub(crate) async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<User>, sqlx::Error> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(User::from_row))
}

pub(crate) async fn find_by_username(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    find_one(pool, "username", username).await
}

pub(crate) async fn find_by_email(
    pool: &SqlitePool,
    email: &str,
) -> Result<Option<User>, sqlx::Error> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower(?)");
    let row = sqlx::query(&sql).bind(email.trim()).fetch_optional(pool).await?;
    Ok(row.as_ref().map(User::from_row))
}

pub(crate) async fn find_by_google_id(
    pool: &SqlitePool,
    google_id: &str,
) -> Result<Option<User>, sqlx::Error> {
    find_one(pool, "google_id", google_id).await
}

pub(crate) async fn username_taken(pool: &SqlitePool, username: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE lower(username) = lower(?)")
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub(crate) async fn create_user(
    pool: &SqlitePool,
    username: &str,
    email: &str,
    password_hash: Option<&str>,
    role: &str,
    now: i64,
) -> Result<i64, sqlx::Error> {
    let res = sqlx::query(
        "INSERT INTO users (username, email, password_hash, role, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(role)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

pub(crate) async fn set_password_hash<'e, E>(
    executor: E,
    user_id: i64,
    hash: &str,
    now: i64,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
        .bind(hash)
        .bind(now)
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn touch_last_login(pool: &SqlitePool, user_id: i64, now: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stores a pending secret; the flag is only flipped by `enable_two_factor`.
pub(crate) async fn store_two_factor_secret(
    pool: &SqlitePool,
    user_id: i64,
    secret: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE users SET two_factor_secret = ?, two_factor_enabled = 0, updated_at = ? WHERE id = ?",
    )
    .bind(secret)
    .bind(now)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn enable_two_factor(pool: &SqlitePool, user_id: i64, now: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET two_factor_enabled = 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn disable_two_factor(pool: &SqlitePool, user_id: i64, now: i64) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE users SET two_factor_secret = NULL, two_factor_enabled = 0, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM backup_codes WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

pub(crate) async fn link_google(
    pool: &SqlitePool,
    user_id: i64,
    google_id: &str,
    profile: &Value,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET google_id = ?, google_profile = ?, updated_at = ? WHERE id = ?")
        .bind(google_id)
        .bind(profile.to_string())
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn unlink_google(pool: &SqlitePool, user_id: i64, now: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET google_id = NULL, google_profile = NULL, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
