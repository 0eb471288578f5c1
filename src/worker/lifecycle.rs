//! Install and activate handling for one cache version.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::http::Request;
use crate::network::Network;

/// Outcome of an install. Individual asset failures never fail the install.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
  pub cache: String,
  /// Assets now present in the cache
  pub cached: Vec<Url>,
  /// Assets that could not be cached, with the reason
  pub failed: Vec<(String, String)>,
  /// Activate right away instead of waiting for old clients to go away
  pub skip_waiting: bool,
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
  pub cache: String,
  /// Stale caches that were removed
  pub deleted: Vec<String>,
  /// Stale caches that could not be removed, with the reason
  pub failed: Vec<(String, String)>,
  /// Take control of already open clients without waiting for a reload
  pub claim_clients: bool,
}

/// Owns the cache version: seeds it on install and garbage-collects every
/// other version on activate.
pub struct CacheLifecycle<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  config: Arc<WorkerConfig>,
}

impl<S: CacheStorage, N: Network> CacheLifecycle<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, config: Arc<WorkerConfig>) -> Self {
    Self {
      storage,
      network,
      config,
    }
  }

  /// Open the current cache and fetch every manifest asset into it.
  ///
  /// Assets are fetched concurrently and independently. Storage failures
  /// that prevent the cache itself from being opened or marked installed are
  /// returned as errors; an install that errors is never considered settled.
  pub async fn install(&self) -> Result<InstallReport> {
    let cache = &self.config.cache_version;
    info!(cache = %cache, assets = self.config.assets.len(), "Installing");

    self.storage.open_cache(cache)?;
    self.storage.store_manifest(cache, &self.config.assets)?;

    let results = join_all(self.config.assets.iter().map(|url| self.cache_asset(url))).await;

    let mut report = InstallReport {
      cache: cache.clone(),
      skip_waiting: true,
      ..Default::default()
    };

    for (asset, reason) in &self.config.invalid_assets {
      warn!(asset = %asset, "Failed to cache: {}", reason);
      report.failed.push((asset.clone(), reason.clone()));
    }

    for (url, result) in self.config.assets.iter().zip(results) {
      match result {
        Ok(()) => report.cached.push(url.clone()),
        Err(e) => {
          warn!(asset = %url, "Failed to cache: {}", e);
          report.failed.push((url.to_string(), e.to_string()));
        }
      }
    }

    self.storage.mark_installed(cache)?;
    info!(
      cache = %cache,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Install settled"
    );

    Ok(report)
  }

  async fn cache_asset(&self, url: &Url) -> Result<()> {
    let request = Request::get(url.clone());
    let response = self.network.fetch(&request).await?;

    if !response.ok() {
      return Err(eyre!("{} responded with status {}", url, response.status));
    }

    self.storage.put(
      &self.config.cache_version,
      &RequestKey::for_request(&request),
      &response,
    )?;
    debug!(asset = %url, "Cached");

    Ok(())
  }

  /// Delete every cache that is not the current version.
  ///
  /// Refuses to run until the current version has finished installing, so an
  /// interrupted install leaves the previous generation's caches in place.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let current = &self.config.cache_version;

    if !self.storage.is_installed(current)? {
      return Err(eyre!(
        "Cache {} has not finished installing; run install before activate",
        current
      ));
    }

    let mut report = ActivateReport {
      cache: current.clone(),
      claim_clients: true,
      ..Default::default()
    };

    for name in self.storage.cache_names()? {
      if &name == current {
        continue;
      }

      match self.storage.delete_cache(&name) {
        Ok(_) => {
          info!(cache = %name, "Deleted stale cache");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(cache = %name, "Failed to delete stale cache: {}", e);
          report.failed.push((name, e.to_string()));
        }
      }
    }

    Ok(report)
  }
}
