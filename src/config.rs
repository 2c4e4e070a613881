use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

pub(crate) const ENV_PROFILE: &str = "DEALER_ENV";
pub(crate) const ENV_DB_URL: &str = "DEALER_DB_URL";
pub(crate) const ENV_HTTP_ADDR: &str = "DEALER_HTTP_ADDR";
pub(crate) const ENV_REMOTE_ADDR: &str = "DEALER_REMOTE_ADDR";
pub(crate) const ENV_JWT_SECRET: &str = "DEALER_JWT_SECRET";
pub(crate) const ENV_FRONTEND_URL: &str = "DEALER_FRONTEND_URL";
pub(crate) const ENV_BACKEND_URL: &str = "DEALER_BACKEND_URL";
pub(crate) const ENV_PUBLIC_DIR: &str = "DEALER_PUBLIC_DIR";
pub(crate) const ENV_UPLOAD_DIR: &str = "DEALER_UPLOAD_DIR";
pub(crate) const ENV_CORS_ORIGIN: &str = "DEALER_CORS_ORIGIN";
pub(crate) const ENV_TRUST_PROXY: &str = "DEALER_TRUST_PROXY";
pub(crate) const ENV_GOOGLE_CLIENT_ID: &str = "DEALER_GOOGLE_CLIENT_ID";
pub(crate) const ENV_GOOGLE_CLIENT_SECRET: &str = "DEALER_GOOGLE_CLIENT_SECRET";
pub(crate) const ENV_GOOGLE_DEFAULT_ROLE: &str = "DEALER_GOOGLE_DEFAULT_ROLE";
pub(crate) const ENV_GOOGLE_MOCK_PROFILE: &str = "DEALER_GOOGLE_MOCK_PROFILE";
pub(crate) const ENV_TOTP_ISSUER: &str = "DEALER_TOTP_ISSUER";
pub(crate) const ENV_MAIL_SNAPSHOT: &str = "DEALER_MAIL_SNAPSHOT";
pub(crate) const ENV_AUDIT_SYNC: &str = "DEALER_AUDIT_SYNC";
pub(crate) const ENV_RESET_LIMIT_COUNT: &str = "DEALER_RESET_LIMIT_COUNT";
pub(crate) const ENV_RESET_LIMIT_WINDOW: &str = "DEALER_RESET_LIMIT_WINDOW";

pub(crate) const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3001";
pub(crate) const DEFAULT_DB_PATH: &str = "data/dealership.db";
const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000";
const DEFAULT_BACKEND_URL: &str = "http://localhost:3001";
const DEFAULT_PUBLIC_DIR: &str = "public";
const DEFAULT_TOTP_ISSUER: &str = "Dealership";
const DEFAULT_RESET_LIMIT_COUNT: u64 = 5;
const DEFAULT_RESET_LIMIT_WINDOW: u64 = 3_600;
// Only ever used by the dev and test profiles.
const DEV_JWT_SECRET: &str = "dealership-dev-secret-change-me";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Profile {
    Dev,
    Test,
    Prod,
}

impl Profile {
    pub(crate) fn from_env() -> Self {
        let raw = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "dev".to_string())
            .to_ascii_lowercase();
        match raw.trim() {
            "test" | "testing" => Profile::Test,
            "prod" | "production" => Profile::Prod,
            _ => Profile::Dev,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Profile::Dev => "dev",
            Profile::Test => "test",
            Profile::Prod => "prod",
        }
    }
}

pub(crate) struct Config {
    pub profile: Profile,
    pub jwt_secret: Option<String>,
    pub frontend_url: String,
    pub backend_url: String,
    pub public_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub cors_origin: String,
    pub trust_proxy: bool,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_default_role: String,
    pub totp_issuer: String,
    pub mail_snapshot: Option<PathBuf>,
    pub reset_limit_count: u64,
    pub reset_limit_window: u64,
}

impl Config {
    fn load() -> Self {
        let profile = Profile::from_env();

        let jwt_secret = non_empty_var(ENV_JWT_SECRET).or_else(|| match profile {
            Profile::Prod => None,
            Profile::Dev | Profile::Test => Some(DEV_JWT_SECRET.to_string()),
        });

        let public_dir = non_empty_var(ENV_PUBLIC_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR));
        let upload_dir = non_empty_var(ENV_UPLOAD_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| public_dir.join("uploads"));

        Config {
            profile,
            jwt_secret,
            frontend_url: trimmed_url(ENV_FRONTEND_URL, DEFAULT_FRONTEND_URL),
            backend_url: trimmed_url(ENV_BACKEND_URL, DEFAULT_BACKEND_URL),
            public_dir,
            upload_dir,
            cors_origin: non_empty_var(ENV_CORS_ORIGIN).unwrap_or_else(|| "*".to_string()),
            trust_proxy: flag_var(ENV_TRUST_PROXY),
            google_client_id: non_empty_var(ENV_GOOGLE_CLIENT_ID),
            google_client_secret: non_empty_var(ENV_GOOGLE_CLIENT_SECRET),
            google_default_role: non_empty_var(ENV_GOOGLE_DEFAULT_ROLE)
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or_else(|| "user".to_string()),
            totp_issuer: non_empty_var(ENV_TOTP_ISSUER)
                .unwrap_or_else(|| DEFAULT_TOTP_ISSUER.to_string()),
            mail_snapshot: non_empty_var(ENV_MAIL_SNAPSHOT).map(PathBuf::from),
            reset_limit_count: u64_var(ENV_RESET_LIMIT_COUNT, DEFAULT_RESET_LIMIT_COUNT),
            reset_limit_window: u64_var(ENV_RESET_LIMIT_WINDOW, DEFAULT_RESET_LIMIT_WINDOW),
        }
    }

    pub(crate) fn google_configured(&self) -> bool {
        self.google_client_id.is_some() && self.google_client_secret.is_some()
    }

    pub(crate) fn google_redirect_uri(&self) -> String {
        format!("{}/api/auth/google/callback", self.backend_url)
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

pub(crate) fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn trimmed_url(key: &str, default: &str) -> String {
    non_empty_var(key)
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

pub(crate) fn flag_var(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|v| {
            let normalized = v.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
}

fn u64_var(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
