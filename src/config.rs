//! Configuration loader and validator for the dashboard core.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::pager::{PagerConfig, MIN_BOUNDED_CACHE};
use crate::poller::PollerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub api: Api,
    pub library: Library,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_observation_seconds: u64,
    pub max_consecutive_failures: u32,
}

/// Dashboard backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub image_proxy: Option<String>,
}

/// Ad library list settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Library {
    pub collection: String,
    pub page_size: u32,
    #[serde(default)]
    pub max_cached_pages: Option<usize>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Database URL, honouring `DATABASE_URL` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/adscope.db", self.app.resolved_data_dir()))
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_millis(self.app.poll_interval_ms),
            max_observation: Duration::from_secs(self.app.max_observation_seconds),
            max_consecutive_failures: self.app.max_consecutive_failures,
        }
    }

    pub fn pager(&self) -> PagerConfig {
        PagerConfig {
            page_size: self.library.page_size,
            max_cached_pages: self.library.max_cached_pages,
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_observation_seconds == 0 {
        return Err(ConfigError::Invalid("app.max_observation_seconds must be > 0"));
    }
    if cfg.app.max_consecutive_failures == 0 {
        return Err(ConfigError::Invalid("app.max_consecutive_failures must be > 0"));
    }

    let base = cfg.api.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Invalid("api.base_url must be non-empty"));
    }
    if reqwest::Url::parse(base).is_err() {
        return Err(ConfigError::Invalid("api.base_url must be an absolute URL"));
    }
    if cfg.api.timeout_ms == 0 {
        return Err(ConfigError::Invalid("api.timeout_ms must be > 0"));
    }
    if let Some(proxy) = &cfg.api.image_proxy {
        if reqwest::Url::parse(proxy).is_err() {
            return Err(ConfigError::Invalid("api.image_proxy must be an absolute URL"));
        }
    }

    if cfg.library.collection.trim().is_empty() {
        return Err(ConfigError::Invalid("library.collection must be non-empty"));
    }
    if cfg.library.page_size == 0 {
        return Err(ConfigError::Invalid("library.page_size must be > 0"));
    }
    if matches!(cfg.library.max_cached_pages, Some(n) if n < MIN_BOUNDED_CACHE) {
        return Err(ConfigError::Invalid(
            "library.max_cached_pages must be at least 4 when set",
        ));
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 3000
  max_observation_seconds: 900
  max_consecutive_failures: 10

api:
  base_url: "http://localhost:8000/"
  token: "YOUR_API_TOKEN"
  timeout_ms: 15000
  image_proxy: "http://localhost:3000/api/image-proxy"

library:
  collection: "ads"
  page_size: 20
  max_cached_pages: 50
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.poller().poll_interval, Duration::from_secs(3));
        assert_eq!(cfg.pager().page_size, 20);
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.api.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("api.base_url")), _ => panic!("wrong error") }

        cfg.api.base_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("absolute URL")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_polling_bounds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.max_observation_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.max_consecutive_failures = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_library() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.library.page_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("page_size")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.library.max_cached_pages = Some(0);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        // Too small to hold the current page and its prefetch window.
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.library.max_cached_pages = Some(3);
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("max_cached_pages")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.library.max_cached_pages = Some(4);
        validate(&cfg).unwrap();

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.library.max_cached_pages = None;
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.library.collection, "ads");
        assert_eq!(cfg.api.token.as_deref(), Some("YOUR_API_TOKEN"));
    }
}
