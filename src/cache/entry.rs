//! Cached responses and the result type returned by the strategies.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::http::{Headers, Request, RequestKey, Response};

/// A stored response. Unique per store by `key`; later writes replace
/// earlier ones.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub url: String,
  pub method: String,
  pub status: StatusCode,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(request: &Request, response: &Response) -> Self {
    Self {
      key: request.key(),
      url: request.url.to_string(),
      method: request.method.as_str().to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  /// Hex SHA-256 of the body.
  pub fn digest(&self) -> String {
    body_digest(&self.body)
  }
}

pub fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// Entry metadata without the body, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
  pub key: RequestKey,
  pub url: String,
  pub size: u64,
  pub digest: String,
  pub stored_at: DateTime<Utc>,
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Served from cache while a background fetch refreshes the entry
  StaleCache,
  /// Network failed, serving a previously cached copy
  Offline,
  /// Synthesized by the fallback provider
  Fallback,
  /// Mutating request accepted into the write queue
  Queued,
}

/// Result of handling one request.
///
/// `background` is the detached cache write or revalidation spawned by the
/// strategy, if any. Dropping it leaves the task running.
#[derive(Debug)]
pub struct CacheResult {
  pub response: Response,
  pub source: CacheSource,
  pub background: Option<JoinHandle<()>>,
}

impl CacheResult {
  pub fn new(response: Response, source: CacheSource) -> Self {
    Self {
      response,
      source,
      background: None,
    }
  }

  pub fn with_background(mut self, handle: JoinHandle<()>) -> Self {
    self.background = Some(handle);
    self
  }

  /// Wait for any background work to settle. Task panics are ignored; the
  /// response has already been produced.
  pub async fn settle(&mut self) {
    if let Some(handle) = self.background.take() {
      let _ = handle.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn test_entry_roundtrips_response() {
    let request = Request::get(Url::parse("http://app.test/styles.css").unwrap());
    let response = Response::new(StatusCode::OK, "body{}").with_header("content-type", "text/css");

    let entry = CacheEntry::from_response(&request, &response);
    assert_eq!(entry.key, request.key());
    assert_eq!(entry.to_response(), response);
  }

  #[test]
  fn test_digest_is_sha256_hex() {
    assert_eq!(
      body_digest(b""),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }
}
