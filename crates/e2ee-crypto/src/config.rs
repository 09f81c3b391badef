//! Client-side tunables, read from the environment with typed defaults
//! (§6, §7 of `SPEC_FULL.md`). No config-file framework is introduced —
//! the teacher reads its own knobs straight from `std::env`/`cfg`, and this
//! crate follows the same convention.

use std::time::Duration;

pub const SIGNED_PREKEY_TTL_MS_DEFAULT: u64 = 7 * 86_400_000;
pub const ONE_TIME_PREKEY_TARGET_DEFAULT: usize = 100;
pub const ONE_TIME_PREKEY_FLOOR_DEFAULT: usize = 20;
pub const MAX_SKIPPED_MESSAGE_KEYS_DEFAULT: usize = 1000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signed_prekey_ttl: Duration,
    pub one_time_prekey_target: usize,
    pub one_time_prekey_floor: usize,
    pub max_skipped_message_keys: usize,
    pub bundle_fetch_timeout: Duration,
    pub bundle_fetch_backoff_initial: Duration,
    pub bundle_fetch_backoff_factor: u32,
    pub bundle_fetch_backoff_cap: Duration,
    pub decrypt_deadline: Duration,
    pub argon2_m_cost_kib: u32,
    pub argon2_t_cost: u32,
    pub argon2_p_cost: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signed_prekey_ttl: Duration::from_millis(SIGNED_PREKEY_TTL_MS_DEFAULT),
            one_time_prekey_target: ONE_TIME_PREKEY_TARGET_DEFAULT,
            one_time_prekey_floor: ONE_TIME_PREKEY_FLOOR_DEFAULT,
            max_skipped_message_keys: MAX_SKIPPED_MESSAGE_KEYS_DEFAULT,
            bundle_fetch_timeout: Duration::from_secs(10),
            bundle_fetch_backoff_initial: Duration::from_secs(1),
            bundle_fetch_backoff_factor: 2,
            bundle_fetch_backoff_cap: Duration::from_secs(60),
            decrypt_deadline: Duration::from_secs(5),
            argon2_m_cost_kib: if cfg!(debug_assertions) { 256 } else { 65536 },
            argon2_t_cost: if cfg!(debug_assertions) { 1 } else { 3 },
            argon2_p_cost: if cfg!(debug_assertions) { 1 } else { 4 },
        }
    }
}

impl ClientConfig {
    /// Read overrides from the environment; unset variables keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u64("SIGNED_PREKEY_TTL_MS") {
            cfg.signed_prekey_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env_usize("ONE_TIME_PREKEY_TARGET") {
            cfg.one_time_prekey_target = v;
        }
        if let Some(v) = env_usize("ONE_TIME_PREKEY_FLOOR") {
            cfg.one_time_prekey_floor = v;
        }
        if let Some(v) = env_usize("MAX_SKIPPED_MESSAGE_KEYS") {
            cfg.max_skipped_message_keys = v;
        }
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
