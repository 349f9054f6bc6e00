//! Configuration module for Ansirun
//!
//! Handles loading configuration from these sources, later ones winning:
//! - Default values
//! - The first existing file among `--config`, `$ANSIRUN_CONFIG`,
//!   `./ansirun.toml` and `~/.ansirun.toml` (TOML, or YAML by extension)
//! - Environment variables
//! - Command-line arguments (applied by the binaries)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::executor::ExecutorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default settings
    pub defaults: Defaults,

    /// SSH settings
    pub ssh: SshConfig,

    /// Colors and output settings
    pub colors: ColorsConfig,

    /// Path of the file the configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Default inventory path
    pub inventory: PathBuf,

    /// Maximum hosts worked on concurrently (0 = all active hosts)
    pub forks: usize,

    /// Per-task, per-host timeout in seconds
    pub task_timeout: u64,

    /// Timeout for single commands issued by modules, in seconds
    pub command_timeout: u64,

    /// Gather facts when a play does not say
    pub gather_facts: bool,

    /// Keep registered vars and facts from one play to the next
    pub carry_registered_vars: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            inventory: PathBuf::from("inventory.ini"),
            forks: 0,
            task_timeout: 300,
            command_timeout: 30,
            gather_facts: false,
            carry_registered_vars: true,
        }
    }
}

/// SSH configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote user when the inventory sets no `ansible_user`
    pub user: String,

    /// Port when the inventory sets no `ansible_port`
    pub port: u16,

    /// Connect timeout in seconds
    pub connect_timeout: u64,

    /// Identity file tried before the default `~/.ssh` keys
    pub identity_file: Option<String>,

    /// Try the SSH agent first
    pub use_agent: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            connect_timeout: 30,
            identity_file: None,
            use_agent: true,
        }
    }
}

/// Colors and output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorsConfig {
    /// Enable colored output
    pub enabled: bool,
}

impl Default for ColorsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = match Self::get_config_paths(config_path)
            .into_iter()
            .find(|p| p.exists())
        {
            Some(path) => Self::from_file(&path)?,
            None => {
                if let Some(explicit) = config_path {
                    anyhow::bail!("config file not found: {}", explicit.display());
                }
                Config::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Candidate configuration files in priority order
    fn get_config_paths(explicit_path: Option<&PathBuf>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.clone()];
        }

        let mut paths = Vec::new();
        if let Ok(env_config) = std::env::var("ANSIRUN_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }
        paths.push(PathBuf::from("ansirun.toml"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".ansirun.toml"));
        }
        paths
    }

    /// Read a single configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let mut config: Config = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("ANSIRUN_FORKS") {
            self.defaults.forks = n;
        }

        if let Some(n) = env_parse("ANSIRUN_TIMEOUT") {
            self.defaults.task_timeout = n;
        }

        if let Ok(value) = std::env::var("ANSIRUN_GATHER_FACTS") {
            if let Some(b) = crate::vars::resolve::to_bool(&serde_json::Value::String(value)) {
                self.defaults.gather_facts = b;
            }
        }

        if let Ok(path) = std::env::var("ANSIRUN_INVENTORY") {
            self.defaults.inventory = PathBuf::from(path);
        }

        if std::env::var("NO_COLOR").is_ok() {
            self.colors.enabled = false;
        }
    }

    /// Settings the play runner needs
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            forks: self.defaults.forks,
            task_timeout: self.defaults.task_timeout,
            command_timeout: self.defaults.command_timeout,
            gather_facts: self.defaults.gather_facts,
            carry_registered_vars: self.defaults.carry_registered_vars,
            ssh: self.ssh.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.forks, 0);
        assert_eq!(config.defaults.task_timeout, 300);
        assert_eq!(config.defaults.inventory, PathBuf::from("inventory.ini"));
        assert!(!config.defaults.gather_facts);
        assert!(config.defaults.carry_registered_vars);
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[defaults]\nforks = 10\ngather_facts = true\n\n[ssh]\nuser = \"deploy\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.defaults.forks, 10);
        assert!(config.defaults.gather_facts);
        assert_eq!(config.ssh.user, "deploy");
        // untouched keys keep defaults
        assert_eq!(config.defaults.task_timeout, 300);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "defaults:\n  task_timeout: 60\ncolors:\n  enabled: false").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.defaults.task_timeout, 60);
        assert!(!config.colors.enabled);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("ANSIRUN_FORKS", "20");
        std::env::set_var("ANSIRUN_GATHER_FACTS", "yes");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.defaults.forks, 20);
        assert!(config.defaults.gather_facts);
        std::env::remove_var("ANSIRUN_FORKS");
        std::env::remove_var("ANSIRUN_GATHER_FACTS");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/ansirun.toml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
