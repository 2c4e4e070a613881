//! Time-based one-time passwords (RFC 6238, HMAC-SHA1) and backup codes.

use base32::Alphabet;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sqlx::SqlitePool;

use crate::session::sha256_hex;

type HmacSha1 = Hmac<Sha1>;

const SECRET_BYTES: usize = 20;
const CODE_DIGITS: u32 = 6;
pub(crate) const STEP_SECS: u64 = 30;
const WINDOW: i64 = 1;
const BACKUP_CODE_COUNT: usize = 8;
const BACKUP_CODE_BYTES: usize = 4;
const SECRET_ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

pub(crate) fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::encode(SECRET_ALPHABET, &bytes)
}

fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    base32::decode(SECRET_ALPHABET, &normalized).filter(|key| !key.is_empty())
}

fn hotp(key: &[u8], counter: u64) -> Option<u32> {
    let mut mac = HmacSha1::new_from_slice(key).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    Some(binary % 10u32.pow(CODE_DIGITS))
}

pub(crate) fn code_at(secret: &str, unix_secs: u64) -> Option<String> {
    let key = decode_secret(secret)?;
    let code = hotp(&key, unix_secs / STEP_SECS)?;
    Some(format!("{code:0width$}", width = CODE_DIGITS as usize))
}

/// Accepts the code for the current step or one step either side.
pub(crate) fn verify_code(secret: &str, code: &str, unix_secs: u64) -> bool {
    let code = code.trim();
    if code.len() != CODE_DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let Some(key) = decode_secret(secret) else {
        return false;
    };
    let Ok(expected) = code.parse::<u32>() else {
        return false;
    };

    let current = (unix_secs / STEP_SECS) as i64;
    (-WINDOW..=WINDOW).any(|delta| {
        let step = current + delta;
        step >= 0 && hotp(&key, step as u64) == Some(expected)
    })
}

pub(crate) fn otpauth_url(issuer: &str, account: &str, secret: &str) -> String {
    let label = format!("{issuer}:{account}");
    let mut url = String::from("otpauth://totp/");
    url.push_str(&url::form_urlencoded::byte_serialize(label.as_bytes()).collect::<String>().replace('+', "%20"));
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("secret", secret)
        .append_pair("issuer", issuer)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &CODE_DIGITS.to_string())
        .append_pair("period", &STEP_SECS.to_string())
        .finish();
    url.push('?');
    url.push_str(&query);
    url
}

pub(crate) fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; BACKUP_CODE_BYTES];
            rng.fill_bytes(&mut bytes);
            hex::encode_upper(bytes)
        })
        .collect()
}

fn normalize_backup_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub(crate) async fn replace_backup_codes(
    pool: &SqlitePool,
    user_id: i64,
    codes: &[String],
    now: i64,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM backup_codes WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    for code in codes {
        sqlx::query("INSERT INTO backup_codes (user_id, code_hash, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(sha256_hex(&normalize_backup_code(code)))
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await
}

/// Marks a matching unused code as used. Returns whether one was consumed.
pub(crate) async fn consume_backup_code(
    pool: &SqlitePool,
    user_id: i64,
    code: &str,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let normalized = normalize_backup_code(code);
    if normalized.is_empty() {
        return Ok(false);
    }
    let res = sqlx::query(
        "UPDATE backup_codes SET used_at = ? WHERE id = (SELECT id FROM backup_codes WHERE user_id = ? AND code_hash = ? AND used_at IS NULL LIMIT 1)",
    )
    .bind(now)
    .bind(user_id)
    .bind(sha256_hex(&normalized))
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// TOTP first, then a single-use backup code.
pub(crate) async fn verify_second_factor(
    pool: &SqlitePool,
    user_id: i64,
    secret: &str,
    code: &str,
    now: u64,
) -> Result<bool, sqlx::Error> {
    if verify_code(secret, code, now) {
        return Ok(true);
    }
    consume_backup_code(pool, user_id, code, now as i64).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::users::create_user;

    // RFC 6238 appendix B seed, "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn matches_rfc6238_sha1_vectors() {
        assert_eq!(code_at(RFC_SECRET, 59).as_deref(), Some("287082"));
        assert_eq!(code_at(RFC_SECRET, 1_111_111_109).as_deref(), Some("081804"));
        assert_eq!(code_at(RFC_SECRET, 1_234_567_890).as_deref(), Some("005924"));
        assert_eq!(code_at(RFC_SECRET, 2_000_000_000).as_deref(), Some("279037"));
    }

    #[test]
    fn verification_window_is_one_step() {
        let now = 1_700_000_000;
        let previous = code_at(RFC_SECRET, now - STEP_SECS).unwrap();
        let next = code_at(RFC_SECRET, now + STEP_SECS).unwrap();
        let stale = code_at(RFC_SECRET, now - 3 * STEP_SECS).unwrap();
        assert!(verify_code(RFC_SECRET, &previous, now));
        assert!(verify_code(RFC_SECRET, &next, now));
        if stale != code_at(RFC_SECRET, now).unwrap() {
            assert!(!verify_code(RFC_SECRET, &stale, now));
        }
    }

    #[test]
    fn malformed_codes_are_rejected() {
        let now = 59;
        assert!(verify_code(RFC_SECRET, " 287082 ", now));
        assert!(!verify_code(RFC_SECRET, "28708", now));
        assert!(!verify_code(RFC_SECRET, "2870821", now));
        assert!(!verify_code(RFC_SECRET, "28a082", now));
        assert!(!verify_code("!!!", "287082", now));
    }

    #[test]
    fn generated_material_has_expected_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert!(decode_secret(&secret).is_some_and(|k| k.len() == SECRET_BYTES));

        let codes = generate_backup_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        assert!(codes.iter().all(|c| {
            c.len() == BACKUP_CODE_BYTES * 2
                && c.chars().all(|ch| ch.is_ascii_digit() || ch.is_ascii_uppercase())
        }));
    }

    #[test]
    fn otpauth_url_carries_parameters() {
        let url = otpauth_url("Dealership", "alice", "ABC");
        assert!(url.starts_with("otpauth://totp/Dealership%3Aalice?"));
        assert!(url.contains("secret=ABC"));
        assert!(url.contains("issuer=Dealership"));
        assert!(url.contains("algorithm=SHA1&digits=6&period=30"));
    }

    #[tokio::test]
    async fn backup_codes_are_single_use() {
        let pool = test_pool().await;
        let uid = create_user(&pool, "gina", "gina@example.com", None, "user", 1)
            .await
            .unwrap();
        let codes = vec!["A1B2C3D4".to_string(), "DEADBEEF".to_string()];
        replace_backup_codes(&pool, uid, &codes, 5).await.unwrap();

        assert!(consume_backup_code(&pool, uid, "a1b2c3d4", 6).await.unwrap());
        assert!(!consume_backup_code(&pool, uid, "A1B2C3D4", 7).await.unwrap());
        assert!(!consume_backup_code(&pool, uid, "", 7).await.unwrap());
        assert!(
            verify_second_factor(&pool, uid, RFC_SECRET, "DEADBEEF", 59)
                .await
                .unwrap()
        );
        assert!(
            verify_second_factor(&pool, uid, RFC_SECRET, "287082", 59)
                .await
                .unwrap()
        );

        replace_backup_codes(&pool, uid, &["00000000".to_string()], 8)
            .await
            .unwrap();
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_codes WHERE user_id = ?")
            .bind(uid)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
