//! Configuration management for lintkeeper
//!
//! Stores settings in ~/.config/lintkeeper/config.toml. The GitLab token is
//! only ever read from the environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::gitlab::DEFAULT_API_BASE;
use crate::review::PublishMode;

const TOKEN_ENV_VARS: &[&str] = &["LINTKEEPER_GITLAB_TOKEN", "GITLAB_TOKEN"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API root, e.g. https://gitlab.example.com/api/v4. Falls back to
    /// `CI_API_V4_URL`, then gitlab.com.
    pub gitlab_api: Option<String>,
    pub publish_mode: PublishMode,
    /// Upper bound on in-flight remote writes per pass. Unset means unbounded.
    pub max_concurrency: Option<usize>,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gitlab_api: None,
            publish_mode: PublishMode::Draft,
            max_concurrency: None,
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lintkeeper"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from `path`, or the default location, or return default
    pub fn load(path: Option<&Path>) -> Self {
        match path.map(Path::to_path_buf).or_else(Self::config_path) {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from a specific file. A missing file yields defaults; a
    /// corrupt one is moved aside and also yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// API root with trailing slashes removed.
    pub fn api_base(&self) -> String {
        self.api_base_with(std::env::var("CI_API_V4_URL").ok())
    }

    fn api_base_with(&self, ci_api: Option<String>) -> String {
        self.gitlab_api
            .clone()
            .or(ci_api)
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// Host name of the API root, for matching git remotes.
    pub fn api_host(&self) -> Option<String> {
        url::Url::parse(&self.api_base())
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Get the GitLab token from the environment
    pub fn get_token() -> Option<String> {
        token_from(|name| std::env::var(name).ok())
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/lintkeeper/config.toml".to_string())
    }
}

fn token_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    TOKEN_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|token| token.trim().to_string())
        .find(|token| !token.is_empty())
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
