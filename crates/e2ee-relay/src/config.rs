//! Server-side tunables, read from the environment with typed defaults
//! (§6, §7), the same convention `e2ee_crypto::config::ClientConfig` uses.

pub const BIND_ADDR_DEFAULT: &str = "127.0.0.1:4433";
pub const DB_PATH_DEFAULT: &str = "e2ee-relay.sqlite3";
pub const PREKEY_UPLOAD_RATE_PER_HOUR_DEFAULT: u32 = 5;
pub const PREKEY_BUNDLE_FETCH_RATE_PER_5MIN_DEFAULT: u32 = 50;
pub const ONE_TIME_PREKEY_REQUEST_CAP: usize = 200;
pub const ONE_TIME_PREKEY_ACCOUNT_CAP: usize = 500;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: String,
    pub prekey_upload_rate_per_hour: u32,
    pub prekey_bundle_fetch_rate_per_5min: u32,
    pub one_time_prekey_request_cap: usize,
    pub one_time_prekey_account_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: BIND_ADDR_DEFAULT.to_string(),
            db_path: DB_PATH_DEFAULT.to_string(),
            prekey_upload_rate_per_hour: PREKEY_UPLOAD_RATE_PER_HOUR_DEFAULT,
            prekey_bundle_fetch_rate_per_5min: PREKEY_BUNDLE_FETCH_RATE_PER_5MIN_DEFAULT,
            one_time_prekey_request_cap: ONE_TIME_PREKEY_REQUEST_CAP,
            one_time_prekey_account_cap: ONE_TIME_PREKEY_ACCOUNT_CAP,
        }
    }
}

impl ServerConfig {
    /// Read overrides from the environment; unset variables keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = env_u32("PREKEY_UPLOAD_RATE_PER_HOUR") {
            cfg.prekey_upload_rate_per_hour = v;
        }
        if let Some(v) = env_u32("PREKEY_BUNDLE_FETCH_RATE_PER_5MIN") {
            cfg.prekey_bundle_fetch_rate_per_5min = v;
        }
        cfg
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
