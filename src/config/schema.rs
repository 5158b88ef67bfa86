use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Where the conversation documents live - computed, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Bot token for the messaging platform.
    pub token: Option<String>,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

// ── Relay ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Seconds a send waits for the platform before reporting a timeout.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Deadline for a whole history reload.
    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,
    /// History fetches in flight at once during a reload (minimum 1).
    #[serde(default = "default_reload_concurrency")]
    pub reload_concurrency: usize,
    /// Fetch only the latest N messages per correspondent. Unset = everything.
    #[serde(default)]
    pub history_limit: Option<usize>,
    /// Trailing lines shown when opening a conversation.
    #[serde(default = "default_display_lines")]
    pub display_lines: usize,
}

fn default_dispatch_timeout_secs() -> u64 {
    15
}

fn default_reload_timeout_secs() -> u64 {
    120
}

fn default_reload_concurrency() -> usize {
    crate::concurrency::DEFAULT_RELOAD_CONCURRENCY
}

fn default_display_lines() -> usize {
    20
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            reload_timeout_secs: default_reload_timeout_secs(),
            reload_concurrency: default_reload_concurrency(),
            history_limit: None,
            display_lines: default_display_lines(),
        }
    }
}

// ── Reliability / supervision ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Initial backoff for gateway reconnects.
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Max backoff for gateway reconnects.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_initial_backoff_secs() -> u64 {
    2
}

fn default_max_backoff_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let dmrelay_dir = home.join(".dmrelay");

        Self {
            config_path: dmrelay_dir.join("config.toml"),
            data_dir: dmrelay_dir.join("data"),
            token: None,
            relay: RelayConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Self::load_or_init_at(&home.join(".dmrelay"))
    }

    /// Load `config.toml` from `dmrelay_dir`, writing defaults on first run.
    pub fn load_or_init_at(dmrelay_dir: &Path) -> Result<Self> {
        let config_path = dmrelay_dir.join("config.toml");
        let data_dir = dmrelay_dir.join("data");

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path;
            config.data_dir = data_dir;
            config
        } else {
            let config = Config {
                config_path,
                data_dir,
                ..Config::default()
            };
            config.save()?;
            config
        };
        config.apply_env_overrides();

        fs::create_dir_all(&config.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.data_dir.display()
            )
        })?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Token: DMRELAY_TOKEN
        if let Ok(token) = std::env::var("DMRELAY_TOKEN") {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }

        // Data directory: DMRELAY_DATA_DIR
        if let Ok(dir) = std::env::var("DMRELAY_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        // Reload concurrency: DMRELAY_RELOAD_CONCURRENCY
        if let Ok(raw) = std::env::var("DMRELAY_RELOAD_CONCURRENCY") {
            if let Ok(n) = raw.trim().parse::<usize>() {
                if n > 0 {
                    self.relay.reload_concurrency = n;
                }
            }
        }
    }

    /// Token with surrounding whitespace removed; `None` when unset or blank.
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        crate::store::write_atomic(&self.config_path, toml_str.as_bytes())
            .context("Failed to atomically replace config file")
    }
}
