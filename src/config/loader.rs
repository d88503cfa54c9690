//! Tiered configuration loading.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ENV_CONFIG_PATH: &str = "TASK_DISPATCH_CONFIG_PATH";
pub const ENV_DB_PATH: &str = "TASK_DISPATCH_DB_PATH";
pub const ENV_STATE_DIR: &str = "TASK_DISPATCH_STATE_DIR";
pub const ENV_POLL_INTERVAL: &str = "TASK_DISPATCH_POLL_INTERVAL";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults = 0,
    Project = 1,
    User = 2,
    Explicit = 3,
    Environment = 4,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Explicit => write!(f, "explicit"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Where each file tier is looked up.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// `./task-dispatch/config.yaml`
    pub project_file: Option<PathBuf>,
    /// `~/.task-dispatch/config.yaml`
    pub user_file: Option<PathBuf>,
    /// `--config` or `TASK_DISPATCH_CONFIG_PATH`; replaces the project and user tiers.
    pub explicit_file: Option<PathBuf>,
}

impl ConfigPaths {
    /// Standard locations, honouring `TASK_DISPATCH_CONFIG_PATH`.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        let explicit_file = explicit.or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));
        Self {
            project_file: Some(PathBuf::from("task-dispatch").join("config.yaml")),
            user_file: dirs::home_dir().map(|h| h.join(".task-dispatch").join("config.yaml")),
            explicit_file,
        }
    }

    /// Explicit tier locations (tests).
    pub fn with_files(project_file: Option<PathBuf>, user_file: Option<PathBuf>) -> Self {
        Self {
            project_file,
            user_file,
            explicit_file: None,
        }
    }
}

/// Loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Config,
    sources: Vec<(ConfigTier, PathBuf)>,
}

impl ConfigLoader {
    /// Load from the standard locations and the environment.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover(explicit))
    }

    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        let mut tiers: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut sources = Vec::new();

        if let Some(explicit) = &paths.explicit_file {
            // An explicit file must exist; a missing tier file is fine
            tiers.push(read_tier(explicit)?.with_context(|| {
                format!("config file {} not found", explicit.display())
            })?);
            sources.push((ConfigTier::Explicit, explicit.clone()));
        } else {
            for (tier, file) in [
                (ConfigTier::Project, &paths.project_file),
                (ConfigTier::User, &paths.user_file),
            ] {
                let Some(file) = file else { continue };
                if let Some(value) = read_tier(file)? {
                    debug!(tier = %tier, path = %file.display(), "loaded config tier");
                    tiers.push(value);
                    sources.push((tier, file.clone()));
                }
            }
        }

        let merged = deep_merge_all(tiers);
        let mut config: Config = serde_json::from_value(merged).context("invalid configuration")?;

        if apply_env_overrides(&mut config) {
            sources.push((ConfigTier::Environment, PathBuf::from("<env>")));
        }

        config.validate()?;

        Ok(Self { config, sources })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Tiers that contributed, lowest first (defaults omitted).
    pub fn sources(&self) -> &[(ConfigTier, PathBuf)] {
        &self.sources
    }
}

/// Read one YAML tier. `Ok(None)` when the file does not exist.
fn read_tier(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Some(Value::Null));
    }
    let value: Value =
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Apply environment overrides. Returns true if any was set.
fn apply_env_overrides(config: &mut Config) -> bool {
    let mut applied = false;

    if let Ok(db_path) = std::env::var(ENV_DB_PATH) {
        config.store.db_path = PathBuf::from(db_path);
        applied = true;
    }

    if let Ok(state_dir) = std::env::var(ENV_STATE_DIR) {
        config.store.state_dir = PathBuf::from(state_dir);
        applied = true;
    }

    if let Ok(raw) = std::env::var(ENV_POLL_INTERVAL) {
        match raw.parse::<u64>() {
            Ok(secs) => {
                config.scheduler.poll_interval_secs = secs;
                applied = true;
            }
            Err(_) => warn!(value = %raw, "ignoring non-numeric {}", ENV_POLL_INTERVAL),
        }
    }

    applied
}
