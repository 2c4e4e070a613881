use regex::Regex;
use serde_json::Value;
use std::process::Command;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{ENV_AUDIT_SYNC, flag_var};
use crate::db::{db_pool, runtime};

const LOG_TAG: &str = "dealership-api";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn log_message(message: &str) {
    // syslog first, stderr so container logs capture it too.
    let _ = Command::new("logger")
        .arg("-t")
        .arg(LOG_TAG)
        .arg(message)
        .status();
    eprintln!("{message}");
}

pub(crate) fn redact_token(input: &str) -> String {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let regex = TOKEN_RE.get_or_init(|| {
        Regex::new(r"(?i)((?:token|refreshToken|code|state|password)=)[^&\s]+").unwrap()
    });
    regex.replace_all(input, "$1***REDACTED***").into_owned()
}

pub(crate) fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    format!("{ts:x}-{seq:04x}")
}

pub(crate) fn current_unix_secs() -> u64 {
    system_time_secs(SystemTime::now())
}

pub(crate) fn system_time_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

struct DbEventRecord {
    request_id: String,
    ts: i64,
    method: String,
    path: Option<String>,
    status: i64,
    action: String,
    duration_ms: i64,
    meta: String,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn persist_event_record(
    request_id: &str,
    ts_secs: u64,
    method: &str,
    path: Option<&str>,
    status: u16,
    action: &str,
    elapsed_ms: u64,
    meta: &Value,
) {
    let pool = db_pool();
    let Ok(meta_str) = serde_json::to_string(meta) else {
        return;
    };

    let record = DbEventRecord {
        request_id: request_id.to_string(),
        ts: ts_secs as i64,
        method: method.to_string(),
        path: path.map(|p| p.to_string()),
        status: status as i64,
        action: action.to_string(),
        duration_ms: elapsed_ms as i64,
        meta: meta_str,
    };

    let fut = async move {
        if let Err(err) = sqlx::query(
            "INSERT INTO event_log (request_id, ts, method, path, status, action, duration_ms, meta) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.request_id)
        .bind(record.ts)
        .bind(record.method)
        .bind(record.path)
        .bind(record.status)
        .bind(record.action)
        .bind(record.duration_ms)
        .bind(record.meta)
        .execute(&pool)
        .await
        {
            log_message(&format!("warn db-insert-failed err={err}"));
        }
    };

    // The `server` child exits right after responding, so a spawned insert
    // would usually be lost there; block unless explicitly relaxed.
    if audit_sync_mode() {
        runtime().block_on(fut);
    } else {
        runtime().spawn(fut);
    }
}

fn audit_sync_mode() -> bool {
    static SYNC_MODE: OnceLock<bool> = OnceLock::new();
    *SYNC_MODE.get_or_init(|| {
        std::env::var(ENV_AUDIT_SYNC)
            .map(|_| flag_var(ENV_AUDIT_SYNC))
            .unwrap_or(true)
    })
}

pub(crate) fn record_system_event(action: &str, status: u16, meta: Value) {
    let ts = current_unix_secs();
    persist_event_record("system", ts, "SYSTEM", None, status, action, 0, &meta);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_token_masks_secrets_in_queries() {
        let raw = "GET /api/auth/google/link?token=abc.def.ghi&x=1 HTTP/1.1";
        assert_eq!(
            redact_token(raw),
            "GET /api/auth/google/link?token=***REDACTED***&x=1 HTTP/1.1"
        );
        assert_eq!(
            redact_token("code=4/0AbC&state=n.1.0.sig"),
            "code=***REDACTED***&state=***REDACTED***"
        );
    }

    #[test]
    fn request_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }
}
