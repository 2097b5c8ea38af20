//! Configuration management.
//!
//! strider configuration can come from:
//! - Environment variables (STRIDER_*)
//! - Config file (~/.config/strider/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// strider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine defaults applied when a workflow does not override them
    #[serde(default)]
    pub engine: EngineConfig,

    /// Browser pool configuration
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// Engine execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default run timeout in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Default per-block timeout in seconds
    #[serde(default = "default_block_timeout")]
    pub block_timeout_seconds: u64,

    /// Default step budget per task
    #[serde(default = "default_max_steps")]
    pub max_steps_per_task: u32,

    /// Default step retry budget per task
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout_seconds: default_run_timeout(),
            block_timeout_seconds: default_block_timeout(),
            max_steps_per_task: default_max_steps(),
            max_step_retries: default_max_step_retries(),
        }
    }
}

fn default_run_timeout() -> u64 {
    3600
}

fn default_block_timeout() -> u64 {
    600
}

fn default_max_steps() -> u32 {
    10
}

fn default_max_step_retries() -> u32 {
    3
}

/// Browser pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Maximum concurrently reserved sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Navigation timeout handed to the driver, in seconds
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout_seconds: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            navigation_timeout_seconds: default_navigation_timeout(),
        }
    }
}

fn default_max_sessions() -> usize {
    5
}

fn default_navigation_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("strider"))
            .unwrap_or_else(|| PathBuf::from(".strider"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("STRIDER_RUN_TIMEOUT_SECONDS") {
            if let Ok(parsed) = value.parse() {
                self.engine.run_timeout_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("STRIDER_BLOCK_TIMEOUT_SECONDS") {
            if let Ok(parsed) = value.parse() {
                self.engine.block_timeout_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("STRIDER_MAX_STEPS_PER_TASK") {
            if let Ok(parsed) = value.parse() {
                self.engine.max_steps_per_task = parsed;
            }
        }
        if let Ok(value) = std::env::var("STRIDER_MAX_STEP_RETRIES") {
            if let Ok(parsed) = value.parse() {
                self.engine.max_step_retries = parsed;
            }
        }
        if let Ok(value) = std::env::var("STRIDER_MAX_BROWSER_SESSIONS") {
            if let Ok(parsed) = value.parse() {
                self.browser.max_sessions = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(browser) = partial.browser {
            self.browser = browser;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    engine: Option<EngineConfig>,
    browser: Option<BrowserConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.engine.max_steps_per_task, 10);
        assert_eq!(config.engine.max_step_retries, 3);
        assert_eq!(config.browser.max_sessions, 5);
    }

    #[test]
    fn partial_toml_overrides_section() {
        let partial: PartialConfig = toml::from_str(
            r#"
[engine]
run_timeout_seconds = 120
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(partial);
        assert_eq!(config.engine.run_timeout_seconds, 120);
        // Untouched section keeps defaults.
        assert_eq!(config.browser.max_sessions, 5);
    }
}
