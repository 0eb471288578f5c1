//! Core types describing where a served response came from.

use chrono::{DateTime, Utc};

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data straight from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data read from the current cache under its own key.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// The cached root document served in place of a failed navigation.
  pub fn navigation_fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::NavigationFallback,
      cached_at: Some(cached_at),
    }
  }

  /// Synthetic placeholder, nothing real was available.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cached entry for the request itself
  Cache,
  /// Cached root document standing in for a navigation
  NavigationFallback,
  /// Synthetic "Offline" placeholder
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::Cache => write!(f, "cache"),
      CacheSource::NavigationFallback => write!(f, "navigation fallback"),
      CacheSource::Offline => write!(f, "offline placeholder"),
    }
  }
}
