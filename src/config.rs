use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::SqliteStorage;
use crate::router::RouteRules;

/// Environment variable that overrides `origin` from the config file.
const ORIGIN_ENV: &str = "RELAYCACHE_ORIGIN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the origin server the cache fronts
  pub origin: String,
  /// Generation tag; bump on every deployment of the shell
  pub generation: String,
  /// Requests under this path prefix are API calls
  pub api_prefix: String,
  /// Path substrings identifying dev-server live-update traffic
  pub live_update_patterns: Vec<String>,
  /// Shell assets pre-populated into the static store on install
  pub manifest: Vec<String>,
  /// Tag used for queued offline mutations
  pub reconnect_tag: String,
  /// Per-request network timeout
  pub timeout_secs: u64,
  /// Database location (defaults to the XDG data directory)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    let rules = RouteRules::default();
    Self {
      origin: "http://localhost:8080".to_string(),
      generation: "v1".to_string(),
      api_prefix: rules.api_prefix,
      live_update_patterns: rules.live_update_patterns,
      manifest: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
      ],
      reconnect_tag: "sync-patient-data".to_string(),
      timeout_secs: 10,
      database: None,
      log_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./relaycache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/relaycache/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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

    if let Ok(origin) = std::env::var(ORIGIN_ENV) {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("relaycache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("relaycache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin URL {}: {}", self.origin, e))
  }

  pub fn route_rules(&self) -> RouteRules {
    RouteRules {
      api_prefix: self.api_prefix.clone(),
      live_update_patterns: self.live_update_patterns.clone(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}
