//! Request identity used to address entries in a cache.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::Request;

/// Normalized request identity (method + URL without fragment).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    Self {
      method,
      url: normalize_url(url),
    }
  }

  /// Key for a plain GET of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(request.method.clone(), &request.url)
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Stable, fixed-length key for storage.
  pub fn cache_hash(&self) -> String {
    let input = format!("{} {}", self.method, self.url);

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// Fragments never reach the server, so they never distinguish responses.
fn normalize_url(url: &Url) -> Url {
  let mut url = url.clone();
  url.set_fragment(None);
  url
}
