//! Per-request serving strategies.

use reqwest::Method;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheResult, CacheStorage, CachedEntry, RequestKey};
use crate::config::{Strategy, WorkerConfig};
use crate::http::{Request, Response};
use crate::network::Network;

/// What the worker did with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not intercepted; the caller performs the request natively
  Passthrough,
  /// A response, tagged with where it came from
  Served(CacheResult<Response>),
  /// No network, no cached copy and no fallback page
  NetworkError,
}

impl FetchOutcome {
  pub fn response(&self) -> Option<&Response> {
    match self {
      FetchOutcome::Served(result) => Some(&result.data),
      _ => None,
    }
  }
}

/// Serves intercepted GET requests from the current cache version and the
/// network, according to the configured strategy.
pub struct RequestInterceptor<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  config: Arc<WorkerConfig>,
  /// Cache writes started by network-first responses
  pending: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CacheStorage + 'static, N: Network> RequestInterceptor<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, config: Arc<WorkerConfig>) -> Self {
    Self {
      storage,
      network,
      config,
      pending: Mutex::new(Vec::new()),
    }
  }

  pub async fn intercept(&self, request: &Request) -> FetchOutcome {
    if request.method != Method::GET {
      debug!(method = %request.method, url = %request.url, "Not intercepted");
      return FetchOutcome::Passthrough;
    }

    match self.config.strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  /// Cached copy if present, otherwise network, otherwise a placeholder.
  /// Network responses are not stored.
  async fn cache_first(&self, request: &Request) -> FetchOutcome {
    let key = RequestKey::for_request(request);

    if let Some(entry) = self.lookup(&key) {
      debug!(url = %request.url, "Served from cache");
      return FetchOutcome::Served(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    match self.network.fetch(request).await {
      Ok(response) => FetchOutcome::Served(CacheResult::from_network(response)),
      Err(e) => {
        warn!(url = %request.url, "Fetch failed: {}", e);
        FetchOutcome::Served(CacheResult::offline(Response::offline()))
      }
    }
  }

  /// Network response if reachable (refreshing the cache in the background),
  /// otherwise the cached copy, otherwise the root document for navigations.
  /// Any HTTP response counts as reachable and is stored, whatever its status.
  async fn network_first(&self, request: &Request) -> FetchOutcome {
    let key = RequestKey::for_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_in_background(key, response.duplicate());
        FetchOutcome::Served(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, "Network unavailable, trying cache: {}", e);

        if let Some(entry) = self.lookup(&key) {
          return FetchOutcome::Served(CacheResult::from_cache(entry.response, entry.cached_at));
        }

        if request.is_navigation() {
          if let Some(fallback) = self.config.fallback_url() {
            if let Some(entry) = self.lookup(&RequestKey::get(fallback)) {
              debug!(url = %request.url, fallback = %fallback, "Serving offline page");
              return FetchOutcome::Served(CacheResult::navigation_fallback(
                entry.response,
                entry.cached_at,
              ));
            }
          }
        }

        warn!(url = %request.url, "No network and no cached copy");
        FetchOutcome::NetworkError
      }
    }
  }

  /// Read failures are treated as misses.
  fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.get(&self.config.cache_version, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key.description(), "Cache read failed: {}", e);
        None
      }
    }
  }

  fn store_in_background(&self, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let cache = self.config.cache_version.clone();

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put(&cache, &key, &response) {
        warn!(key = %key.description(), "Cache write failed: {}", e);
      }
    });

    match self.pending.lock() {
      Ok(mut pending) => {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
      }
      Err(e) => warn!("Lock poisoned: {}", e),
    }
  }

  fn take_pending(&self) -> Vec<JoinHandle<()>> {
    match self.pending.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(e) => {
        warn!("Lock poisoned: {}", e);
        Vec::new()
      }
    }
  }

  /// Wait for every background cache write started so far.
  pub async fn flush(&self) {
    for handle in self.take_pending() {
      if let Err(e) = handle.await {
        warn!("Background cache write did not complete: {}", e);
      }
    }
  }
}
