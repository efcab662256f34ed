use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::router::RouteConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Site origin the worker sits in front of
  pub origin: String,
  /// Address the proxy listens on
  pub listen: String,
  /// Database location (defaults to the platform data directory)
  pub data_path: Option<PathBuf>,
  /// Generation tag appended to every cache name
  pub cache_version: String,
  /// Paths stored in the static cache at install time
  pub precache: Vec<String>,
  /// Page served to navigations that fail both network and cache
  pub offline_page: String,
  /// Image served when an image can be neither fetched nor found in cache
  pub placeholder_image: String,
  pub image_cache: ImageCacheConfig,
  pub routes: RouteConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub analytics: AnalyticsConfig,
  /// Upstream request timeout in seconds
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
  /// Ceiling on the summed body size of the image cache
  pub max_bytes: u64,
  pub overflow: ImageOverflowPolicy,
}

/// What to do when a new image would push the cache past its ceiling.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImageOverflowPolicy {
  /// Skip caching the new image; existing entries stay
  #[default]
  Skip,
  /// Evict the oldest entries until the new image fits
  EvictOldest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Endpoint listing recent photo URLs for the photo sync
  pub recent_photos_endpoint: String,
  /// Interval of the periodic photo sync in seconds (0 disables it)
  pub photo_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub icon: String,
  pub badge: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
  /// Collector the event buffer is flushed to
  pub endpoint: String,
  /// Seconds between background flushes while serving (0 disables)
  pub flush_interval_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      listen: "127.0.0.1:8787".to_string(),
      data_path: None,
      cache_version: "v1".to_string(),
      precache: vec![
        "/".to_string(),
        "/offline".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192x192.png".to_string(),
        "/icons/icon-512x512.png".to_string(),
        "/images/placeholder.svg".to_string(),
      ],
      offline_page: "/offline".to_string(),
      placeholder_image: "/images/placeholder.svg".to_string(),
      image_cache: ImageCacheConfig::default(),
      routes: RouteConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      analytics: AnalyticsConfig::default(),
      request_timeout_secs: 30,
    }
  }
}

impl Default for ImageCacheConfig {
  fn default() -> Self {
    Self {
      max_bytes: 50 * 1024 * 1024,
      overflow: ImageOverflowPolicy::Skip,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      recent_photos_endpoint: "/api/photos/recent".to_string(),
      photo_sync_interval_secs: 3600,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "Wedding update".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
    }
  }
}

impl Default for AnalyticsConfig {
  fn default() -> Self {
    Self {
      endpoint: "/analytics".to_string(),
      flush_interval_secs: 60,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./wedding-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/wedding-sw/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.origin_url()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("wedding-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("wedding-sw").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// The parsed site origin.
  pub fn origin_url(&self) -> Result<Url> {
    let url = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http or https, got '{}'", self.origin));
    }

    Ok(url)
  }

  /// Resolve a site path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.data_path {
      Some(p) => Ok(p.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}
