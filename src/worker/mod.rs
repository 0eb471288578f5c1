//! Offline asset worker.
//!
//! Couples the cache lifecycle (install/activate) and the request
//! interceptor through one shared [`WorkerConfig`]. A runtime adapter drives
//! it through the three entry points `on_install`, `on_activate` and
//! `on_fetch`.

mod interceptor;
mod lifecycle;

pub use interceptor::FetchOutcome;
pub use lifecycle::{ActivateReport, InstallReport};

use interceptor::RequestInterceptor;
use lifecycle::CacheLifecycle;

use color_eyre::Result;
use std::sync::Arc;

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::http::Request;
use crate::network::Network;

/// One worker generation, bound to a single cache version.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  lifecycle: CacheLifecycle<S, N>,
  interceptor: RequestInterceptor<S, N>,
}

impl<S: CacheStorage + 'static, N: Network> ServiceWorker<S, N> {
  pub fn new(config: WorkerConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    let config = Arc::new(config);
    Self {
      lifecycle: CacheLifecycle::new(
        Arc::clone(&storage),
        Arc::clone(&network),
        Arc::clone(&config),
      ),
      interceptor: RequestInterceptor::new(storage, network, config),
    }
  }

  /// Seed the current cache version with the asset manifest.
  pub async fn on_install(&self) -> Result<InstallReport> {
    self.lifecycle.install().await
  }

  /// Drop every cache version except the current one.
  pub async fn on_activate(&self) -> Result<ActivateReport> {
    self.lifecycle.activate().await
  }

  /// Produce a response for an intercepted request. Never fails; total
  /// unavailability is reported as [`FetchOutcome::NetworkError`].
  pub async fn on_fetch(&self, request: &Request) -> FetchOutcome {
    self.interceptor.intercept(request).await
  }

  /// Wait for cache writes started by earlier fetches.
  pub async fn flush(&self) {
    self.interceptor.flush().await
  }
}


#[cfg(test)]
mod tests {
  use super::testing::{worker_config, FakeNetwork};
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::config::Strategy;
  use url::Url;

  fn url(path: &str) -> Url {
    Url::parse("https://example.org/").unwrap().join(path).unwrap()
  }

  fn site() -> FakeNetwork {
    FakeNetwork::new()
      .with("https://example.org/index.html", 200, "<html>v1</html>")
      .with("https://example.org/app.js", 200, "console.log(1)")
  }

  #[tokio::test]
  async fn test_upgrade_scenario() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(site());

    let v1 = ServiceWorker::new(
      worker_config("v1", Strategy::CacheFirst, &["/index.html", "/app.js"]),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    v1.on_install().await.unwrap();
    v1.on_activate().await.unwrap();

    network.route("https://example.org/index.html", 200, "<html>v2</html>");
    let v2 = ServiceWorker::new(
      worker_config("v2", Strategy::CacheFirst, &["/index.html", "/app.js"]),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    let install = v2.on_install().await.unwrap();
    assert_eq!(install.cached.len(), 2);
    assert_eq!(storage.keys("v2").unwrap().len(), 2);

    // The old generation keeps serving its own cache while v2 waits.
    network.set_online(false);
    let old = v1.on_fetch(&Request::get(url("/index.html"))).await;
    assert_eq!(old.response().unwrap().text(), "<html>v1</html>");

    let activate = v2.on_activate().await.unwrap();
    assert_eq!(activate.deleted, vec!["v1".to_string()]);
    assert_eq!(storage.cache_names().unwrap(), vec!["v2".to_string()]);

    let new = v2.on_fetch(&Request::get(url("/index.html"))).await;
    assert_eq!(new.response().unwrap().text(), "<html>v2</html>");
  }

  #[tokio::test]
  async fn test_cache_first_offline_placeholder_for_uncached_asset() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let worker = ServiceWorker::new(
      worker_config("v2", Strategy::CacheFirst, &["/index.html"]),
      storage,
      Arc::clone(&network),
    );
    network.set_online(false);

    let outcome = worker.on_fetch(&Request::get(url("/app.js"))).await;

    match outcome {
      FetchOutcome::Served(result) => {
        assert_eq!(result.source, CacheSource::Offline);
        assert_eq!(result.data.text(), "Offline");
      }
      other => panic!("expected offline placeholder, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_network_first_offline_session() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(site().with("https://example.org/api/me", 200, "{\"id\":1}"));
    let worker = ServiceWorker::new(
      worker_config("v1", Strategy::NetworkFirst, &["/index.html", "/app.js"]),
      Arc::clone(&storage),
      Arc::clone(&network),
    );
    worker.on_install().await.unwrap();
    worker.on_activate().await.unwrap();

    let online = worker.on_fetch(&Request::get(url("/api/me"))).await;
    assert_eq!(
      online.response().map(|r| r.text()),
      Some("{\"id\":1}".to_string())
    );
    worker.flush().await;

    network.set_online(false);
    let calls = network.calls();

    let api = worker.on_fetch(&Request::get(url("/api/me"))).await;
    assert_eq!(api.response().unwrap().text(), "{\"id\":1}");

    let page = worker.on_fetch(&Request::navigate(url("/settings"))).await;
    match page {
      FetchOutcome::Served(result) => {
        assert_eq!(result.source, CacheSource::NavigationFallback);
        assert_eq!(result.data.text(), "<html>v1</html>");
      }
      other => panic!("expected fallback page, got {:?}", other),
    }

    let image = worker.on_fetch(&Request::get(url("/avatar.png"))).await;
    assert!(matches!(image, FetchOutcome::NetworkError));
    assert_eq!(network.calls(), calls + 3);
  }

  #[tokio::test]
  async fn test_explicit_fallback_is_installed_and_served_offline() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(site().with(
      "https://example.org/offline.html",
      200,
      "<html>offline</html>",
    ));
    let config = worker_config("v1", Strategy::NetworkFirst, &["/index.html"])
      .with_fallback(url("/offline.html"));
    let worker = ServiceWorker::new(config, Arc::clone(&storage), Arc::clone(&network));

    let install = worker.on_install().await.unwrap();
    assert!(install.failed.is_empty());
    assert!(install.cached.contains(&url("/offline.html")));

    network.set_online(false);
    let page = worker.on_fetch(&Request::navigate(url("/settings"))).await;
    match page {
      FetchOutcome::Served(result) => {
        assert_eq!(result.source, CacheSource::NavigationFallback);
        assert_eq!(result.data.text(), "<html>offline</html>");
      }
      other => panic!("expected offline page, got {:?}", other),
    }
  }
}
