use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::DEFAULT_POLL_INTERVAL;
use crate::request::DEFAULT_DISPOSE_TIMEOUT;
use crate::scm::ScmSettings;
use crate::session::{DEFAULT_MAX_ENRICHMENT_ATTEMPTS, DEFAULT_POOL_SIZE, SessionSettings};

const CONFIG_SCHEMA_VERSION: u32 = 1;
const CONFIG_FILE_NAME: &str = "timelapse-config.json";
const LOG_FILE_NAME: &str = "timelapse.log";
const MAX_POOL_SIZE: usize = 16;
const DEFAULT_TICK_MS: u64 = 33;
pub const DEFAULT_HG_EXECUTABLE: &str = "hg";
pub const DEFAULT_MAINLINE_BRANCH: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimelapseConfig {
    pub schema_version: u32,
    pub hg_executable: String,
    pub mainline_branch: String,
    pub include_merges: bool,
    pub enrichment_pool_size: usize,
    pub max_enrichment_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub dispose_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            hg_executable: DEFAULT_HG_EXECUTABLE.to_string(),
            mainline_branch: DEFAULT_MAINLINE_BRANCH.to_string(),
            include_merges: false,
            enrichment_pool_size: DEFAULT_POOL_SIZE,
            max_enrichment_attempts: DEFAULT_MAX_ENRICHMENT_ATTEMPTS,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
        }
    }
}

impl TimelapseConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: TimelapseConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = TimelapseConfig::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn scm_settings(&self, runtime: &RuntimeSettings) -> ScmSettings {
        ScmSettings {
            executable: self.hg_executable.clone(),
            mainline_branch: self.mainline_branch.clone(),
            include_merges: self.include_merges,
            dispose_timeout: runtime.dispose_timeout,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            pool_size: self.enrichment_pool_size,
            max_enrichment_attempts: self.max_enrichment_attempts,
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }
        if normalize_required_string(&mut self.hg_executable, DEFAULT_HG_EXECUTABLE) {
            changed = true;
        }
        if normalize_required_string(&mut self.mainline_branch, DEFAULT_MAINLINE_BRANCH) {
            changed = true;
        }

        let pool_size = self.enrichment_pool_size.clamp(1, MAX_POOL_SIZE);
        if pool_size != self.enrichment_pool_size {
            self.enrichment_pool_size = pool_size;
            changed = true;
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        poll_interval: Duration::from_millis(env_millis(
            "TIMELAPSE_POLL_MS",
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )),
        dispose_timeout: Duration::from_millis(env_millis(
            "TIMELAPSE_DISPOSE_TIMEOUT_MS",
            DEFAULT_DISPOSE_TIMEOUT.as_millis() as u64,
        )),
        tick_interval: Duration::from_millis(env_millis("TIMELAPSE_TICK_MS", DEFAULT_TICK_MS)),
    }
}

pub fn timelapse_home() -> PathBuf {
    if let Ok(custom) = env::var("TIMELAPSE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .map(|dir| dir.join("timelapse"))
        .unwrap_or_else(|| PathBuf::from(".timelapse"))
}

pub fn config_path() -> PathBuf {
    timelapse_home().join(CONFIG_FILE_NAME)
}

pub fn log_path() -> PathBuf {
    timelapse_home().join(LOG_FILE_NAME)
}

fn env_millis(name: &str, default: u64) -> u64 {
    parse_positive(env::var(name).ok().as_deref()).unwrap_or(default)
}

fn parse_positive(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

fn normalize_required_string(value: &mut String, default: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        *value = default.to_string();
        return true;
    }
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
        return true;
    }
    false
}
