use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::forge::{RunnerSettings, SchedulerSettings};

pub const CONFIG_FILE: &str = "forge.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ForgeConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Bearer token for the admin API. Unset means loopback-only access.
    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub runs: RunDefaults,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    /// Resolved data directory; not read from the file.
    #[serde(skip)]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_trigger_window")]
    pub trigger_window_minutes: u32,
    #[serde(default = "default_tick_cron")]
    pub tick_cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunDefaults {
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default = "default_max_messages")]
    pub default_max_messages: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotConfig {
    /// Falls back to a machine-derived key when unset.
    #[serde(default)]
    pub encryption_secret: Option<String>,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    17990
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_trigger_window() -> u32 {
    10
}
fn default_tick_cron() -> String {
    "0 * * * * *".to_string()
}
fn default_true() -> bool {
    true
}
fn default_ttl_hours() -> u64 {
    4
}
fn default_refresh_secs() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    120
}
fn default_max_iterations() -> u32 {
    3
}
fn default_batch_size() -> usize {
    50
}
fn default_max_messages() -> usize {
    40
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            trigger_window_minutes: default_trigger_window(),
            tick_cron: default_tick_cron(),
            enabled: true,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            refresh_interval_secs: default_refresh_secs(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            default_batch_size: default_batch_size(),
            default_max_messages: default_max_messages(),
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            api_port: default_api_port(),
            admin_token: None,
            scheduler: SchedulerConfig::default(),
            lock: LockConfig::default(),
            generation: GenerationConfig::default(),
            runs: RunDefaults::default(),
            snapshots: SnapshotConfig::default(),
            data_dir: PathBuf::new(),
        }
    }
}

/// `FORGE_DATA_DIR`, else `~/.agent-forge`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FORGE_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-forge")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ForgeConfig {
    /// Read `<data_dir>/forge.toml` (defaults when absent), then apply the
    /// process environment.
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let mut config = Self::load_file(data_dir.as_ref()).await?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(
            "Loaded forge config: api={}:{}, scheduler tz={}, lock ttl={}h, generation={}",
            config.api_host,
            config.api_port,
            config.scheduler.timezone,
            config.lock.ttl_hours,
            if config.generation.api_key.is_some() { "enabled" } else { "fallback only" }
        );
        Ok(config)
    }

    async fn load_file(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str::<ForgeConfig>(&content)
                .with_context(|| format!("invalid {}", config_path.display()))?
        } else {
            info!("No {} found in {}, using defaults.", CONFIG_FILE, data_dir.display());
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Environment overrides. `lookup` is the variable source.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = non_empty(lookup("FORGE_API_HOST")) {
            self.api_host = host;
        }
        if let Some(port) = non_empty(lookup("FORGE_API_PORT")) {
            self.api_port = port
                .parse()
                .with_context(|| format!("FORGE_API_PORT is not a port: {}", port))?;
        }
        if let Some(token) = non_empty(lookup("FORGE_ADMIN_TOKEN")) {
            self.admin_token = Some(token);
        }
        if let Some(tz) = non_empty(lookup("FORGE_TIMEZONE")) {
            self.scheduler.timezone = tz;
        }
        if let Some(key) = non_empty(lookup("OPENAI_API_KEY")) {
            self.generation.api_key = Some(key);
        }
        if let Some(url) = non_empty(lookup("FORGE_GENERATION_BASE_URL")) {
            self.generation.base_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.timezone()?;
        if self.lock.ttl_hours == 0 {
            anyhow::bail!("lock.ttl_hours must be at least 1");
        }
        if self.scheduler.trigger_window_minutes == 0 || self.scheduler.trigger_window_minutes > 24 * 60 {
            anyhow::bail!("scheduler.trigger_window_minutes must be within one day");
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.scheduler
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("unknown scheduler timezone '{}': {}", self.scheduler.timezone, e))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_hours * 3600)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            refresh_interval: Duration::from_secs(self.lock.refresh_interval_secs.max(1)),
            default_max_iterations: self.runs.default_max_iterations.max(1),
            default_batch_size: self.runs.default_batch_size.max(1),
            default_max_messages: self.runs.default_max_messages.max(1),
            ..Default::default()
        }
    }

    pub fn scheduler_settings(&self) -> Result<SchedulerSettings> {
        Ok(SchedulerSettings {
            timezone: self.timezone()?,
            trigger_window_minutes: self.scheduler.trigger_window_minutes,
            tick_cron: self.scheduler.tick_cron.clone(),
            enabled: self.scheduler.enabled,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.request_timeout_secs.max(1))
    }
}
