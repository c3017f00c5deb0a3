use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000; // SQLite waits this long on a locked db
pub const ENV_PREFIX: &str = "CHRONIK_";

/// Top-level config (chronik.toml + CHRONIK_* env overrides).
///
/// Nested keys are separated by a double underscore in the environment, e.g.
/// `CHRONIK_DATABASE__BUSY_TIMEOUT_MS=250`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChronikConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding the `jobs` table. `:memory:` opens a private
    /// in-memory database.
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Re-arm every active job from the store when the controller starts.
    /// Override with env var: CHRONIK_SCHEDULER__FILL_ON_START=false
    #[serde(default = "bool_true")]
    pub fill_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fill_on_start: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chronik/chronik.db", home)
}

impl ChronikConfig {
    /// Load config from a TOML file with CHRONIK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chronik/chronik.toml
    ///
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading chronik config");

        let config: ChronikConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chronik/chronik.toml", home)
}
