use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheGeneration;

/// Environment variable that overrides the configured release tag.
pub const RELEASE_ENV: &str = "OFFGRID_RELEASE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// The single origin whose requests are intercepted
  pub origin: String,
  /// Release tag embedded in every store name
  pub release: String,
  /// Used as the default notification title and on the offline page
  pub app_name: String,
  /// Application shell, pre-populated on install and served cache-first
  pub core_assets: Vec<String>,
  /// Path prefix of the JSON API (network-first)
  pub api_prefix: String,
  /// Path substrings that mark authentication traffic (network-first)
  pub auth_patterns: Vec<String>,
  /// Where the database and logs live (default: $XDG_DATA_HOME/offgrid)
  pub data_dir: Option<PathBuf>,
  pub request_timeout_secs: u64,
  pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Replay attempts before an item is dead-lettered; 0 retries forever
  pub max_attempts: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self { max_attempts: 10 }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      release: "v1".to_string(),
      app_name: "PropertyPro".to_string(),
      core_assets: ["/", "/index.html", "/calculator", "/styles.css", "/app.js", "/manifest.json"]
        .into_iter()
        .map(String::from)
        .collect(),
      api_prefix: "/api/".to_string(),
      auth_patterns: ["auth", "login", "logout", "session", "token"]
        .into_iter()
        .map(String::from)
        .collect(),
      data_dir: None,
      request_timeout_secs: 30,
      queue: QueueConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Built-in defaults apply when no file is found. `OFFGRID_RELEASE`
  /// overrides the release tag either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(release) = std::env::var(RELEASE_ENV) {
      config.release = release;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin()?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("Origin must be an http(s) URL: {}", self.origin));
    }
    if self.release.trim().is_empty() {
      return Err(eyre!("Release tag must not be empty"));
    }
    if let Some(asset) = self.core_assets.iter().find(|a| !a.starts_with('/')) {
      return Err(eyre!("Core asset paths must start with '/': {}", asset));
    }
    if self.request_timeout_secs == 0 {
      return Err(eyre!("request_timeout_secs must be greater than 0"));
    }
    Ok(())
  }

  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn generation(&self) -> CacheGeneration {
    CacheGeneration::new(self.release.clone())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Resolve the data directory, falling back to the platform default.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("offgrid.db"))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("logs"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.core_assets.len(), 6);
    assert_eq!(config.generation(), CacheGeneration::new("v1"));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: https://homes.example.com
release: v7
queue:
  max_attempts: 3
"#,
    )
    .unwrap();

    assert_eq!(config.release, "v7");
    assert_eq!(config.queue.max_attempts, 3);
    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.origin().unwrap().host_str(), Some("homes.example.com"));
  }

  #[test]
  fn test_validate_rejects_relative_asset() {
    let config = Config {
      core_assets: vec!["app.js".to_string()],
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_bad_origin() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_zero_timeout() {
    let config = Config {
      request_timeout_secs: 0,
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("request_timeout_secs"));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offgrid.yaml");
    std::fs::write(&path, "app_name: Homestead\ndata_dir: /tmp/offgrid-test\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.app_name, "Homestead");
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/offgrid-test/offgrid.db")
    );
  }

  #[test]
  fn test_data_dir_override() {
    let config = Config {
      data_dir: Some(PathBuf::from("/srv/offgrid")),
      ..Config::default()
    };
    assert_eq!(config.log_dir().unwrap(), PathBuf::from("/srv/offgrid/logs"));
  }
}
