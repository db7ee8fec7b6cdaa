use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::CachePolicy;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub origin: OriginConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Override for the store location (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
  /// Origin paths precached into the static shell at install
  #[serde(default)]
  pub shell: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
  pub base_url: String,
  /// Path prefix mutations are posted under, keyed by action kind
  #[serde(default = "default_mutations_path")]
  pub mutations_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_mutations_path() -> String {
  "api/sync".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache version tag; defaults to the crate version so partitions roll
  /// over on upgrade
  pub version: Option<String>,
  pub api_max_age_secs: u64,
  pub image_max_age_secs: u64,
  pub static_max_age_secs: u64,
  pub dynamic_max_age_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: None,
      api_max_age_secs: 300,
      image_max_age_secs: 30 * 86_400,
      static_max_age_secs: 7 * 86_400,
      dynamic_max_age_secs: 86_400,
    }
  }
}

impl CacheConfig {
  pub fn version(&self) -> String {
    self
      .version
      .clone()
      .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
  }

  pub fn policy(&self) -> CachePolicy {
    CachePolicy {
      api: secs(self.api_max_age_secs),
      image: secs(self.image_max_age_secs),
      static_assets: secs(self.static_max_age_secs),
      dynamic: secs(self.dynamic_max_age_secs),
    }
  }
}

fn secs(n: u64) -> chrono::Duration {
  chrono::Duration::seconds(n as i64)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./medsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/medsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(EngineError::Config(format!(
          "config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(EngineError::Config(
        "no configuration file found; create one at ~/.config/medsync/config.yaml".to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("medsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("medsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      EngineError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    serde_yaml::from_str(&contents).map_err(|e| {
      EngineError::Config(format!("failed to parse config file {}: {}", path.display(), e))
    })
  }

  /// Resolve the configured shell paths against the origin base URL.
  pub fn shell_urls(&self, base: &Url) -> Result<Vec<Url>> {
    self
      .shell
      .iter()
      .map(|path| {
        base
          .join(path)
          .map_err(|e| EngineError::Config(format!("invalid shell resource {path}: {e}")))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_full_config() {
    let yaml = r#"
origin:
  base_url: "https://app.example.com"
  timeout_secs: 10
cache:
  version: "v7"
  api_max_age_secs: 60
shell:
  - "/"
  - "/manifest.json"
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.origin.base_url, "https://app.example.com");
    assert_eq!(config.origin.timeout_secs, 10);
    assert_eq!(config.origin.mutations_path, "api/sync");
    assert_eq!(config.cache.version(), "v7");
    assert_eq!(config.cache.api_max_age_secs, 60);
    // Unset fields keep their defaults
    assert_eq!(config.cache.dynamic_max_age_secs, 86_400);
    assert_eq!(config.shell.len(), 2);
  }

  #[test]
  fn test_version_defaults_to_crate_version() {
    let cache = CacheConfig::default();
    assert_eq!(cache.version(), format!("v{}", env!("CARGO_PKG_VERSION")));
  }

  #[test]
  fn test_shell_urls_resolve_against_base() {
    let yaml = r#"
origin:
  base_url: "https://app.example.com"
shell:
  - "/"
  - "/assets/app.css"
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let base = Url::parse(&config.origin.base_url).unwrap();
    let urls = config.shell_urls(&base).unwrap();
    assert_eq!(urls[0].as_str(), "https://app.example.com/");
    assert_eq!(urls[1].as_str(), "https://app.example.com/assets/app.css");
  }
}
