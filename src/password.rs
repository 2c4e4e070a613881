use regex::Regex;
use std::sync::OnceLock;

pub(crate) const BCRYPT_COST: u32 = 10;
const MIN_PASSWORD_LEN: usize = 8;
const MAX_EMAIL_LEN: usize = 255;

pub(crate) fn hash_password(plain: &str) -> Result<String, String> {
    bcrypt::hash(plain, BCRYPT_COST).map_err(|e| e.to_string())
}

/// A malformed stored hash counts as a mismatch.
pub(crate) fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PasswordIssue {
    TooShort,
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
}

impl PasswordIssue {
    pub(crate) fn message(self) -> &'static str {
        match self {
            PasswordIssue::TooShort => "Password must be at least 8 characters long",
            PasswordIssue::MissingUppercase => {
                "Password must contain at least one uppercase letter"
            }
            PasswordIssue::MissingLowercase => {
                "Password must contain at least one lowercase letter"
            }
            PasswordIssue::MissingDigit => "Password must contain at least one number",
        }
    }
}

pub(crate) fn check_password_strength(password: &str) -> Result<(), PasswordIssue> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(PasswordIssue::TooShort);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(PasswordIssue::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PasswordIssue::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordIssue::MissingDigit);
    }
    Ok(())
}

pub(crate) fn valid_username(username: &str) -> bool {
    static USERNAME_RE: OnceLock<Regex> = OnceLock::new();
    USERNAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{3,50}$").unwrap())
        .is_match(username)
}

pub(crate) fn valid_email(email: &str) -> bool {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    email.len() <= MAX_EMAIL_LEN
        && EMAIL_RE
            .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
            .is_match(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_rules_in_order() {
        assert_eq!(check_password_strength("Ab1"), Err(PasswordIssue::TooShort));
        assert_eq!(
            check_password_strength("abcdefg1"),
            Err(PasswordIssue::MissingUppercase)
        );
        assert_eq!(
            check_password_strength("ABCDEFG1"),
            Err(PasswordIssue::MissingLowercase)
        );
        assert_eq!(
            check_password_strength("Abcdefgh"),
            Err(PasswordIssue::MissingDigit)
        );
        assert!(check_password_strength("Abcdefg1").is_ok());
    }

    #[test]
    fn hash_verifies_only_the_original() {
        let hash = hash_password("Sup3rSecret").unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("Sup3rSecret", &hash));
        assert!(!verify_password("sup3rsecret", &hash));
        assert!(!verify_password("Sup3rSecret", "not-a-bcrypt-hash"));
    }

    #[test]
    fn username_and_email_shapes() {
        assert!(valid_username("admin_01"));
        assert!(valid_username("a-b"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("has space"));
        assert!(!valid_username(&"x".repeat(51)));

        assert!(valid_email("sales@dealer.example"));
        assert!(!valid_email("no-at-sign.example"));
        assert!(!valid_email("two@@dealer.example"));
        assert!(!valid_email("a b@dealer.example"));
        let long = format!("{}@dealer.example", "x".repeat(250));
        assert!(!valid_email(&long));
    }
}
