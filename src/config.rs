//! Service configuration.
//!
//! Loaded from `~/.funnelsync/config.json`; a missing file yields defaults.
//! Environment variables override individual fields so deployments can steer
//! the service without editing the file. Per-project state (tokens,
//! organization scope, timezone) lives in the database, not here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::EventStatus;

/// Env override for the booking API base URL.
const ENV_API_BASE_URL: &str = "FUNNELSYNC_API_BASE_URL";
/// Env override for the HTTP listen address.
const ENV_BIND_ADDRESS: &str = "FUNNELSYNC_BIND_ADDRESS";
/// Env override for the SQLite path.
const ENV_DATABASE_PATH: &str = "FUNNELSYNC_DATABASE_PATH";
/// Env override toggling the cron scheduler ("1"/"true" to enable).
const ENV_SCHEDULER_ENABLED: &str = "FUNNELSYNC_SCHEDULER_ENABLED";

/// One cron schedule with its evaluation timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    /// Standard 5-field cron expression.
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "*/30 * * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Base URL of the booking platform API.
    pub api_base_url: String,
    /// Address the trigger server binds to.
    pub bind_address: String,
    /// SQLite path override. None = `~/.funnelsync/funnelsync.db`.
    pub database_path: Option<PathBuf>,
    /// Incremental sync schedule.
    pub schedule: ScheduleEntry,
    /// Statuses each run walks. The source filters one status per call.
    pub statuses: Vec<EventStatus>,
    /// Page size requested from the source's list endpoints.
    pub page_size: u32,
    /// Wall-clock budget for one run; checked at page boundaries.
    pub run_deadline_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.booking-platform.com/v2".to_string(),
            bind_address: "127.0.0.1:8787".to_string(),
            database_path: None,
            schedule: ScheduleEntry::default(),
            statuses: EventStatus::ALL.to_vec(),
            page_size: 100,
            run_deadline_secs: 600,
        }
    }
}

/// Resolve the config file path: `~/.funnelsync/config.json`.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".funnelsync").join("config.json"))
}

impl AppConfig {
    /// Load config from disk and apply env overrides.
    ///
    /// A missing or unreadable file falls back to defaults with a warning —
    /// the service should come up even on a fresh machine.
    pub fn load() -> Self {
        let mut config = config_path()
            .and_then(|path| {
                if !path.exists() {
                    return None;
                }
                match std::fs::read_to_string(&path) {
                    Ok(text) => match serde_json::from_str::<AppConfig>(&text) {
                        Ok(config) => Some(config),
                        Err(e) => {
                            log::warn!(
                                "Failed to parse {}: {}. Using defaults.",
                                path.display(),
                                e
                            );
                            None
                        }
                    },
                    Err(e) => {
                        log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                        None
                    }
                }
            })
            .unwrap_or_default();

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_BASE_URL) {
            self.api_base_url = url;
        }
        if let Ok(addr) = std::env::var(ENV_BIND_ADDRESS) {
            self.bind_address = addr;
        }
        if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(enabled) = std::env::var(ENV_SCHEDULER_ENABLED) {
            self.schedule.enabled = matches!(enabled.as_str(), "1" | "true" | "TRUE" | "True");
        }
    }
}
