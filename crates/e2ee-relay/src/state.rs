//! Shared server state passed to every axum handler, mirroring the
//! `Arc<ServerState>` the teacher's e2e test server wraps its pool and
//! keystore handle in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::db::RelayDb;

pub struct AppState {
    pub db: RelayDb,
    pub config: ServerConfig,
    upload_events: Mutex<HashMap<String, Vec<i64>>>,
    fetch_events: Mutex<HashMap<String, Vec<i64>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: RelayDb, config: ServerConfig) -> Self {
        Self {
            db,
            config,
            upload_events: Mutex::new(HashMap::new()),
            fetch_events: Mutex::new(HashMap::new()),
        }
    }

    /// Record a prekey upload attempt and report whether it breaches the
    /// per-user hourly cap (§4.7, §6 `PREKEY_UPLOAD_RATE_PER_HOUR`).
    pub fn check_upload_rate(&self, user_id: &str, now_unix_ms: i64) -> bool {
        Self::check_rate(
            &self.upload_events,
            user_id,
            now_unix_ms,
            Duration::from_secs(3600).as_millis() as i64,
            self.config.prekey_upload_rate_per_hour as usize,
        )
    }

    /// Record a bundle-fetch attempt and report whether it breaches the
    /// per-user 5-minute cap (§6 `PREKEY_BUNDLE_FETCH_RATE_PER_5MIN`).
    pub fn check_fetch_rate(&self, user_id: &str, now_unix_ms: i64) -> bool {
        Self::check_rate(
            &self.fetch_events,
            user_id,
            now_unix_ms,
            Duration::from_secs(300).as_millis() as i64,
            self.config.prekey_bundle_fetch_rate_per_5min as usize,
        )
    }

    fn check_rate(
        events: &Mutex<HashMap<String, Vec<i64>>>,
        user_id: &str,
        now_unix_ms: i64,
        window_ms: i64,
        cap: usize,
    ) -> bool {
        let mut guard = events.lock();
        let timestamps = guard.entry(user_id.to_string()).or_default();
        timestamps.retain(|ts| now_unix_ms - *ts < window_ms);
        if timestamps.len() >= cap {
            return false;
        }
        timestamps.push(now_unix_ms);
        true
    }
}

pub fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_millis() as i64
}
