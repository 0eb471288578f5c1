//! Request and response types seen by the worker.
//!
//! Only the method, URL and request mode are ever consulted when deciding how
//! to serve a request. Responses carry their body as an owned buffer; they are
//! deliberately not `Clone`, so any dual use has to go through
//! [`Response::duplicate`].

use reqwest::Method;
use url::Url;

/// How the request was initiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// A full page load
  Navigate,
  /// Anything loaded by a page (scripts, styles, images, API calls)
  #[default]
  Subresource,
}

/// An outgoing request intercepted by the worker.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  /// A GET subresource request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Subresource,
    }
  }

  /// A GET navigation request.
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// A response produced by the network or read back from the cache store.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Placeholder returned when neither cache nor network can answer.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Whether the status is in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Copy the response into an independent buffer.
  ///
  /// The copy shares nothing with `self`, so one can be handed to the caller
  /// while the other is persisted.
  pub fn duplicate(&self) -> Self {
    Self {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.to_vec(),
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
