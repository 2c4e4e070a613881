use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;
use std::fs::{self, File};
use std::future::Future;
use std::path::Path;
use std::sync::{OnceLock, RwLock};
use tokio::runtime::Runtime;

use crate::audit::log_message;
use crate::config::{DEFAULT_DB_PATH, ENV_DB_URL};

static DB_RUNTIME: OnceLock<Runtime> = OnceLock::new();
static DB_POOL: OnceLock<SqlitePool> = OnceLock::new();
static DB_INIT_STATUS: OnceLock<RwLock<DbInitStatus>> = OnceLock::new();
pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub(crate) struct DbInitStatus {
    pub url: String,
    pub error: Option<String>,
}

pub(crate) fn db_url() -> String {
    env::var(ENV_DB_URL)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("sqlite://{DEFAULT_DB_PATH}"))
}

pub(crate) fn runtime() -> &'static Runtime {
    DB_RUNTIME.get_or_init(|| Runtime::new().expect("failed to create db runtime"))
}

pub(crate) fn db_pool() -> SqlitePool {
    DB_POOL.get_or_init(init_db_pool).clone()
}

fn init_db_pool() -> SqlitePool {
    let url = db_url();
    let trimmed = url.trim().to_string();
    let runtime = runtime();

    if !trimmed.starts_with("sqlite://") && !trimmed.starts_with("sqlite::") {
        let message = format!("unsupported database url: {url} (only sqlite:// is supported)");
        log_message(&format!("warn db-init-unsupported {message}"));
        set_db_status(&url, Some(message.clone()));
        return memory_fallback(runtime).unwrap_or_else(|_| panic!("{message}"));
    }

    let storage_ready = ensure_sqlite_storage(&trimmed).err();
    let pool_result = runtime.block_on(async {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&trimmed)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok::<SqlitePool, sqlx::Error>(pool)
    });

    match pool_result {
        Ok(pool) => {
            set_db_status(&url, None);
            pool
        }
        Err(err) => {
            let mut message = format!("failed to initialize database at {url}: {err}");
            if let Some(storage_err) = storage_ready {
                message.push_str(&format!("; {storage_err}"));
            }
            message.push_str(&format!("; adjust {ENV_DB_URL}"));

            log_message(&format!("warn db-init-fallback {message}"));
            set_db_status(&url, Some(message.clone()));
            memory_fallback(runtime).unwrap_or_else(|_| panic!("{message}"))
        }
    }
}

fn memory_fallback(runtime: &Runtime) -> Result<SqlitePool, sqlx::Error> {
    runtime.block_on(async {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok::<SqlitePool, sqlx::Error>(pool)
    })
}

fn ensure_sqlite_storage(conn: &str) -> Result<(), String> {
    let Some(raw) = conn.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = Path::new(raw.split('?').next().unwrap_or(raw));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = fs::create_dir_all(parent) {
                let message = format!("db-dir-create-failed path={} err={}", parent.display(), err);
                log_message(&format!("warn {message}"));
                return Err(message);
            }
        }
    }

    // sqlx refuses to open a missing file unless mode=rwc is given.
    if !path.exists() {
        if let Err(err) = File::create(path) {
            let message = format!("db-file-create-failed path={} err={}", path.display(), err);
            log_message(&format!("warn {message}"));
            return Err(message);
        }
    }

    Ok(())
}

fn set_db_status(url: &str, error: Option<String>) {
    let lock = DB_INIT_STATUS.get_or_init(|| {
        RwLock::new(DbInitStatus {
            url: url.to_string(),
            error: None,
        })
    });
    if let Ok(mut status) = lock.write() {
        status.url = url.to_string();
        status.error = error;
    }
}

pub(crate) fn db_status() -> DbInitStatus {
    DB_INIT_STATUS
        .get_or_init(|| {
            RwLock::new(DbInitStatus {
                url: "unknown".into(),
                error: None,
            })
        })
        .read()
        .map(|s| s.clone())
        .unwrap_or(DbInitStatus {
            url: "unknown".into(),
            error: None,
        })
}

pub(crate) fn db_init_error() -> Option<String> {
    db_status().error
}

/// Runs an async database closure on the shared runtime and flattens the
/// error into a string for the handler layer.
pub(crate) fn with_db<F, Fut, T>(f: F) -> Result<T, String>
where
    F: FnOnce(SqlitePool) -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>> + Send + 'static,
    T: Send + 'static,
{
    let pool = db_pool();
    if let Some(err) = db_init_error() {
        return Err(err);
    }

    runtime()
        .block_on(async move { f(pool).await })
        .map_err(|e| e.to_string())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    MIGRATOR.run(&pool).await.unwrap();
    pool
}
