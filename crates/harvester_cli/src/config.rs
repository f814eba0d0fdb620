//! Configuration file support for harvester.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `HARVESTER_`, sections separated by
//!    `__`, e.g. `HARVESTER_RUN__MAX_WORKERS`), plus `GITHUB_TOKEN`
//! 3. Config file (`./harvester.toml`, then ~/.config/harvester/config.toml)
//! 4. Built-in defaults
//!
//! Cache, state, mirrors and output default to subdirectories of the XDG state
//! directory (`~/.local/state/harvester` on Linux).
//!
//! Example config file:
//! ```toml
//! [github]
//! token = "ghp_..."  # or HARVESTER_GITHUB__TOKEN / GITHUB_TOKEN
//!
//! [storage]
//! data_dir = "/var/lib/harvester"
//!
//! [run]
//! max_workers = 5
//! requests_per_minute = 60
//! window_days = 7
//! use_git_mirror = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use harvester::HarvestConfig;
use harvester::config::{
    DEFAULT_API_BASE_URL, DEFAULT_GIT_BASE_URL, DEFAULT_MAX_CACHE_BYTES, DEFAULT_MAX_WORKERS,
    DEFAULT_MIRROR_DEPTH, DEFAULT_RATE_LIMIT_ABORT_THRESHOLD, DEFAULT_WINDOW_DAYS,
};
use harvester::rate_limit::DEFAULT_REQUESTS_PER_MINUTE;
use harvester::retry::{DEFAULT_BASE_WAIT, DEFAULT_MAX_RETRIES};
use serde::Deserialize;

const APP_NAME: &str = "harvester";

const MIB: u64 = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: GitHubConfig,
    pub storage: StorageConfig,
    pub run: RunConfig,
}

/// GitHub access.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// API token. Also read from `HARVESTER_GITHUB__TOKEN` or `GITHUB_TOKEN`.
    pub token: Option<String>,
    pub api_url: String,
    /// Base URL repositories are cloned from.
    pub git_url: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_BASE_URL.to_string(),
            git_url: DEFAULT_GIT_BASE_URL.to_string(),
        }
    }
}

/// Where data lives on disk.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for cache, state, mirrors and output. Defaults to the state directory.
    pub data_dir: Option<PathBuf>,
    /// Overrides `{data_dir}/output`.
    pub output_dir: Option<PathBuf>,
    pub max_cache_mb: u64,
}

/// Run defaults.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_workers: usize,
    pub requests_per_minute: u32,
    pub max_retries: usize,
    /// Base backoff wait in seconds.
    pub base_wait_secs: u64,
    pub request_timeout_secs: u64,
    pub git_timeout_secs: u64,
    /// Window used by incremental runs with no history.
    pub window_days: u32,
    pub use_git_mirror: bool,
    pub mirror_depth: u32,
    pub rate_limit_abort_threshold: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        let library = HarvestConfig::default();
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            max_retries: DEFAULT_MAX_RETRIES,
            base_wait_secs: DEFAULT_BASE_WAIT.as_secs(),
            request_timeout_secs: library.request_timeout.as_secs(),
            git_timeout_secs: library.git_timeout.as_secs(),
            window_days: DEFAULT_WINDOW_DAYS,
            use_git_mirror: true,
            mirror_depth: DEFAULT_MIRROR_DEPTH,
            rate_limit_abort_threshold: DEFAULT_RATE_LIMIT_ABORT_THRESHOLD,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            output_dir: None,
            max_cache_mb: DEFAULT_MAX_CACHE_BYTES / MIB,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/harvester/config.toml)
    /// 3. Local config file (./harvester.toml)
    /// 4. Environment variables with the HARVESTER_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(proj_dirs) = ProjectDirs::from("", "", APP_NAME) {
            let xdg_config = proj_dirs.config_dir().join("config.toml");
            if xdg_config.exists() {
                tracing::debug!(path = %xdg_config.display(), "Loading config");
                builder = builder.add_source(
                    File::from(xdg_config)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        let local_config = PathBuf::from("harvester.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./harvester.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(Self::environment());

        let mut config = match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to deserialize config, using defaults");
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build config, using defaults");
                Config::default()
            }
        };

        if config.github.token.is_none() {
            config.github.token = std::env::var("GITHUB_TOKEN")
                .ok()
                .filter(|t| !t.is_empty());
        }
        config
    }

    /// `HARVESTER_RUN__MAX_WORKERS` -> `run.max_workers`.
    fn environment() -> Environment {
        Environment::with_prefix("HARVESTER")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn github_token(&self) -> Option<&str> {
        self.github.token.as_deref().filter(|t| !t.is_empty())
    }

    /// Root directory for all harvester data.
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .or_else(Self::default_state_dir)
            .unwrap_or_else(|| PathBuf::from("harvester-data"))
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/harvester` or `~/.local/state/harvester`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }

    /// Build the library configuration. `token` may be empty for maintenance commands.
    pub fn harvest_config(&self, token: &str) -> HarvestConfig {
        let mut config = HarvestConfig::with_data_dir(token, self.data_dir());
        if let Some(output_dir) = &self.storage.output_dir {
            config.output_dir = output_dir.clone();
        }
        config.api_base_url = self.github.api_url.clone();
        config.git_base_url = self.github.git_url.clone();
        config.max_cache_bytes = self.storage.max_cache_mb.saturating_mul(MIB);

        let run = &self.run;
        config.max_workers = run.max_workers;
        config.requests_per_minute = run.requests_per_minute;
        config.max_retries = run.max_retries;
        config.base_wait = Duration::from_secs(run.base_wait_secs);
        config.request_timeout = Duration::from_secs(run.request_timeout_secs);
        config.git_timeout = Duration::from_secs(run.git_timeout_secs);
        config.default_window_days = run.window_days;
        config.use_git_mirror = run.use_git_mirror;
        config.mirror_depth = run.mirror_depth;
        config.rate_limit_abort_threshold = run.rate_limit_abort_threshold;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        ConfigBuilder::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.github.token.is_none());
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.run.max_workers, 5);
        assert_eq!(config.run.requests_per_minute, 60);
        assert_eq!(config.run.max_retries, 5);
        assert_eq!(config.run.window_days, 7);
        assert!(config.run.use_git_mirror);
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config = parse(
            r#"
            [run]
            max_workers = 12
            use_git_mirror = false
        "#,
        );
        assert_eq!(config.run.max_workers, 12);
        assert!(!config.run.use_git_mirror);
        assert_eq!(config.run.requests_per_minute, 60);
        assert_eq!(config.run.mirror_depth, 500);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config = parse(
            r#"
            [github]
            token = "ghp_test"
            favourite_colour = "green"
        "#,
        );
        assert_eq!(config.github_token(), Some("ghp_test"));
    }

    #[test]
    fn test_empty_token_is_no_token() {
        let config = parse(
            r#"
            [github]
            token = ""
        "#,
        );
        assert_eq!(config.github_token(), None);
    }

    #[test]
    fn test_harvest_config_uses_data_dir_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.run.base_wait_secs = 3;
        config.run.window_days = 14;

        let harvest = config.harvest_config("tkn");
        assert_eq!(harvest.token, "tkn");
        assert_eq!(harvest.cache_dir, dir.path().join("cache"));
        assert_eq!(harvest.state_file, dir.path().join("state.json"));
        assert_eq!(harvest.mirror_dir, dir.path().join("mirrors"));
        assert_eq!(harvest.output_dir, dir.path().join("output"));
        assert_eq!(harvest.base_wait, Duration::from_secs(3));
        assert_eq!(harvest.default_window_days, 14);
        assert_eq!(harvest.max_cache_bytes, DEFAULT_MAX_CACHE_BYTES);
    }

    #[test]
    fn test_output_dir_override() {
        let config = parse(
            r#"
            [storage]
            data_dir = "/srv/harvester"
            output_dir = "/srv/exports"
            max_cache_mb = 64
        "#,
        );
        let harvest = config.harvest_config("");
        assert_eq!(harvest.output_dir, PathBuf::from("/srv/exports"));
        assert_eq!(harvest.state_file, PathBuf::from("/srv/harvester/state.json"));
        assert_eq!(harvest.max_cache_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_default_state_dir() {
        if let Some(dir) = Config::default_state_dir() {
            assert!(dir.ends_with("harvester"));
        }
    }
}
