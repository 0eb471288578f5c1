use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Name of the current cache; bump whenever `assets` changes
  pub cache_version: String,
  /// Base that relative asset URLs are resolved against
  pub base_url: String,
  #[serde(default)]
  pub strategy: Strategy,
  /// Asset manifest, cached on install
  #[serde(default)]
  pub assets: Vec<String>,
  /// Root document served for failed navigations (defaults to the first asset)
  pub fallback: Option<String>,
  /// Cache database location (defaults to $XDG_DATA_HOME/precache/cache.db)
  pub storage_path: Option<PathBuf>,
  pub request_timeout_secs: Option<u64>,
}

/// How intercepted GET requests are served.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve from cache when present, otherwise network, otherwise "Offline"
  #[default]
  CacheFirst,
  /// Serve from network and refresh the cache, fall back to cache when offline
  NetworkFirst,
}

/// Resolved settings the worker is constructed with.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub cache_version: String,
  pub base_url: Url,
  pub strategy: Strategy,
  /// Manifest entries that resolved to URLs, in order
  pub assets: Vec<Url>,
  /// Manifest entries that could not be resolved, with the reason
  pub invalid_assets: Vec<(String, String)>,
  pub fallback: Option<Url>,
}

impl WorkerConfig {
  pub fn new(cache_version: &str, base_url: Url, strategy: Strategy) -> Self {
    Self {
      cache_version: cache_version.to_string(),
      base_url,
      strategy,
      assets: Vec::new(),
      invalid_assets: Vec::new(),
      fallback: None,
    }
  }

  /// Append an asset, resolved against the base URL.
  pub fn with_asset(mut self, asset: &str) -> Self {
    match self.resolve(asset) {
      Ok(url) => self.assets.push(url),
      Err(e) => self.invalid_assets.push((asset.to_string(), e.to_string())),
    }
    self
  }

  /// Use `fallback` as the offline page. It joins the manifest if it is not
  /// already listed, so install always tries to cache it.
  pub fn with_fallback(mut self, fallback: Url) -> Self {
    if !self.assets.contains(&fallback) {
      self.assets.push(fallback.clone());
    }
    self.fallback = Some(fallback);
    self
  }

  /// Resolve a possibly relative URL against the base URL.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base_url
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  /// The root document used as the offline page for navigations.
  pub fn fallback_url(&self) -> Option<&Url> {
    self.fallback.as_ref().or_else(|| self.assets.first())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// An explicit path must exist. Otherwise the first existing candidate
  /// from [`Config::candidate_paths`] is used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if p.exists() => p.to_path_buf(),
      Some(p) => return Err(eyre!("Config file not found: {}", p.display())),
      None => Self::candidate_paths()
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| {
          eyre!(
            "No configuration file found. Create ./precache.yaml or ~/.config/precache/config.yaml\n\
             with at least `cache_version` and `base_url`."
          )
        })?,
    };

    let contents = std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// ./precache.yaml, then $XDG_CONFIG_HOME/precache/config.yaml.
  fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("precache.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("precache").join("config.yaml"));
    }
    paths
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache_version.trim().is_empty() {
      return Err(eyre!("cache_version must not be empty"));
    }
    Url::parse(&self.base_url)
      .map_err(|e| eyre!("Invalid base_url '{}': {}", self.base_url, e))?;
    Ok(())
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    self.request_timeout_secs.map(Duration::from_secs)
  }

  /// Resolve URLs and build the value the worker is constructed with.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let base_url = Url::parse(&self.base_url)
      .map_err(|e| eyre!("Invalid base_url '{}': {}", self.base_url, e))?;

    let mut worker = WorkerConfig::new(&self.cache_version, base_url, self.strategy);
    for asset in &self.assets {
      worker = worker.with_asset(asset);
    }

    if let Some(fallback) = &self.fallback {
      let url = worker.resolve(fallback)?;
      worker = worker.with_fallback(url);
    }

    Ok(worker)
  }
}
