//! Network access for the worker.
//!
//! The worker only ever talks to the network through [`Network`], so tests
//! can script it. [`HttpNetwork`] is the real implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::http::{Request, Response};

/// Something that can perform a request over the network.
///
/// `Ok` means a response arrived, whatever its status. `Err` means the
/// transport failed (offline, DNS, TLS, timeout, ...).
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// HTTP network backed by reqwest
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use url::Url;

  /// Serve one canned HTTP response on a loopback port.
  async fn serve_once(raw: &'static str) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = Vec::new();
      let mut chunk = [0u8; 1024];
      while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
          break;
        }
        buf.extend_from_slice(&chunk[..n]);
      }
      socket.write_all(raw.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
    });

    Url::parse(&format!("http://{}/data.json", addr)).unwrap()
  }

  #[tokio::test]
  async fn test_error_status_is_a_response() {
    let url = serve_once(
      "HTTP/1.1 404 Not Found\r\n\
       Content-Type: text/plain\r\n\
       Content-Length: 4\r\n\
       Connection: close\r\n\
       \r\n\
       gone",
    )
    .await;
    let network = HttpNetwork::new(Some(Duration::from_secs(5))).unwrap();

    let response = network.fetch(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(!response.ok());
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.text(), "gone");
  }

  #[tokio::test]
  async fn test_unreachable_host_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let network = HttpNetwork::new(Some(Duration::from_secs(5))).unwrap();

    let url = Url::parse(&format!("http://{}/", addr)).unwrap();
    let result = network.fetch(&Request::get(url)).await;

    assert!(result.is_err());
  }
}
