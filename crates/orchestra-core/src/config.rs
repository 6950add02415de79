use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Path of the gateway endpoint that accepts notification batches.
pub const PUSH_PATH: &str = "/api/push";

/// Top-level config (orchestra.toml + ORCHESTRA_* env overrides).
///
/// Nested keys are addressed with a double underscore in the environment,
/// e.g. `ORCHESTRA_NOTIFY__GORUSH_URL=http://gorush:8088`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestraConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Rearm policy for runs that abort before advancing the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// First backoff after an aborted run (seconds); doubles on each further abort.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Backoff ceiling (seconds).
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
    /// Consecutive aborted runs after which a job is reported as stalled.
    #[serde(default = "default_stall_alarm_after")]
    pub stall_alarm_after: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            stall_alarm_after: default_stall_alarm_after(),
        }
    }
}

/// Push gateway (gorush) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Base URL of the gateway; `/api/push` is appended.
    pub gorush_url: Option<String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    /// APNs topic, required for iOS targets.
    pub ios_topic: Option<String>,
    /// FCM click action, required for Android targets.
    pub android_click_action: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per target, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// In-flight requests for bulk broadcasts.
    #[serde(default = "default_bulk_concurrency")]
    pub bulk_concurrency: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            gorush_url: None,
            basic_auth_user: None,
            basic_auth_password: None,
            ios_topic: None,
            android_click_action: None,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            bulk_concurrency: default_bulk_concurrency(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.orchestra/orchestra.db", home)
}

fn default_retry_base_secs() -> u64 {
    30
}

fn default_retry_max_secs() -> u64 {
    600
}

fn default_stall_alarm_after() -> u32 {
    5
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_bulk_concurrency() -> usize {
    8
}

impl OrchestraConfig {
    /// Load config from a TOML file with ORCHESTRA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.orchestra/orchestra.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: OrchestraConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ORCHESTRA_").split("__"))
            .extract()
            .map_err(|e| crate::error::OrchestraError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.orchestra/orchestra.toml", home)
}
