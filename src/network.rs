//! The network seam: everything the agent sends upstream goes through
//! [`Network::fetch`].

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use thiserror::Error;

use crate::http::{Headers, Request, Response};

/// Transport-level failure. An HTTP error status is *not* a `NetworkError`;
/// it arrives as an ordinary [`Response`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("network unreachable: {0}")]
  Offline(String),

  #[error("request timed out: {0}")]
  Timeout(String),

  #[error("network error: {0}")]
  Other(String),
}

impl From<reqwest::Error> for NetworkError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      NetworkError::Timeout(err.to_string())
    } else if err.is_connect() {
      NetworkError::Offline(err.to_string())
    } else {
      NetworkError::Other(err.to_string())
    }
  }
}

#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network backed by a pooled reqwest client.
/// Clone is cheap - reqwest::Client uses Arc internally.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub mod mock {
  //! Scripted in-memory network for tests.

  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  use async_trait::async_trait;
  use reqwest::StatusCode;

  use super::{Network, NetworkError};
  use crate::http::{Request, Response};

  /// Routes are matched on URL path (plus query, if any) regardless of
  /// method. Unrouted paths answer 404.
  pub struct MockNetwork {
    routes: Mutex<HashMap<String, Response>>,
    failing: Mutex<HashMap<String, NetworkError>>,
    calls: Mutex<Vec<String>>,
    online: AtomicBool,
  }

  impl MockNetwork {
    pub fn new() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        failing: Mutex::new(HashMap::new()),
        calls: Mutex::new(Vec::new()),
        online: AtomicBool::new(true),
      }
    }

    pub fn route(&self, path: &str, status: u16, body: &str) {
      let status = StatusCode::from_u16(status).unwrap();
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), Response::new(status, body));
    }

    /// Make a single path unreachable.
    pub fn fail(&self, path: &str) {
      self.fail_with(path, NetworkError::Offline(path.to_string()));
    }

    /// Make a single path fail with a specific transport error.
    pub fn fail_with(&self, path: &str, error: NetworkError) {
      self.failing.lock().unwrap().insert(path.to_string(), error);
    }

    pub fn heal(&self, path: &str) {
      self.failing.lock().unwrap().remove(path);
    }

    pub fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    /// Calls made so far, as `"METHOD path"`.
    pub fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    fn target(request: &Request) -> String {
      match request.url.query() {
        Some(query) => format!("{}?{}", request.url.path(), query),
        None => request.url.path().to_string(),
      }
    }
  }

  #[async_trait]
  impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
      let target = Self::target(request);
      self
        .calls
        .lock()
        .unwrap()
        .push(format!("{} {}", request.method, target));

      if !self.online.load(Ordering::SeqCst) {
        return Err(NetworkError::Offline(target));
      }
      if let Some(error) = self.failing.lock().unwrap().get(&target) {
        return Err(error.clone());
      }

      let routes = self.routes.lock().unwrap();
      Ok(
        routes
          .get(&target)
          .cloned()
          .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, "not found")),
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::mock::MockNetwork;
  use super::*;
  use url::Url;

  #[tokio::test]
  async fn test_mock_network_offline_and_routes() {
    let network = MockNetwork::new();
    network.route("/app.js", 200, "console.log(1)");
    let request = Request::get(Url::parse("http://app.test/app.js").unwrap());

    let response = network.fetch(&request).await.unwrap();
    assert_eq!(response.text(), "console.log(1)");

    network.set_online(false);
    let err = network.fetch(&request).await.unwrap_err();
    assert!(matches!(err, NetworkError::Offline(_)));
    assert_eq!(network.call_count(), 2);
  }

  #[test]
  fn test_http_network_builds() {
    assert!(HttpNetwork::new(Duration::from_secs(5)).is_ok());
  }
}
