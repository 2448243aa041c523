//! Request and response values that flow through the agent.
//!
//! These are deliberately plain data: the interceptor, the cache store and
//! the write queue all need to clone, persist and compare them.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

/// Header map with lowercase names, ordered for stable serialization.
pub type Headers = BTreeMap<String, String>;

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Cache key for this request.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }

  /// Whether the request changes server state (and may be queued offline).
  pub fn is_mutating(&self) -> bool {
    [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(&self.method)
  }

  /// Classify what kind of body the caller is prepared to receive.
  pub fn accepts(&self, api_prefix: &str) -> AcceptKind {
    let path = self.url.path();

    match self.header("accept") {
      Some(accept) if accept.contains("text/html") => AcceptKind::Document,
      Some(accept) if accept.contains("application/json") => AcceptKind::Json,
      _ if path.starts_with(api_prefix) => AcceptKind::Json,
      None if !has_extension(path) => AcceptKind::Document,
      _ => AcceptKind::Other,
    }
  }
}

fn has_extension(path: &str) -> bool {
  path
    .rsplit('/')
    .next()
    .map(|segment| segment.contains('.'))
    .unwrap_or(false)
}

/// What the caller negotiated via its `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptKind {
  /// A navigable HTML document
  Document,
  /// Structured JSON data
  Json,
  /// Anything else (images, fonts, scripts)
  Other,
}

/// A response produced by the network, the cache, or the fallback provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: StatusCode,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  /// A JSON response from an already-encoded body.
  pub fn json(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status, body).with_header("content-type", "application/json")
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

/// Normalized `METHOD url` identity of a request within a store.
///
/// The fragment never reaches the server, so it is dropped; the query string
/// is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method.as_str(), url))
  }

  /// Rebuild a key read back from storage.
  pub fn from_stored(raw: String) -> Self {
    Self(raw)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Serializable form of a [`Request`], used as the write-queue payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
  pub method: String,
  pub url: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
}

impl From<&Request> for RequestRecord {
  fn from(request: &Request) -> Self {
    Self {
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
    }
  }
}

impl RequestRecord {
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))?;
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid url '{}': {}", self.url, e))?;

    Ok(Request {
      method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_key_drops_fragment_keeps_query() {
    let a = Request::get(url("http://app.test/page?x=1#top"));
    let b = Request::get(url("http://app.test/page?x=1"));
    let c = Request::get(url("http://app.test/page?x=2"));

    assert_eq!(a.key(), b.key());
    assert_ne!(a.key(), c.key());
    assert_eq!(a.key().as_str(), "GET http://app.test/page?x=1");
  }

  #[test]
  fn test_key_includes_method() {
    let get = Request::get(url("http://app.test/api/save"));
    let post = Request::new(Method::POST, url("http://app.test/api/save"));
    assert_ne!(get.key(), post.key());
  }

  #[test]
  fn test_accepts_negotiation() {
    let html = Request::get(url("http://app.test/calculator")).with_header("Accept", "text/html,*/*");
    assert_eq!(html.accepts("/api/"), AcceptKind::Document);

    let json = Request::get(url("http://app.test/data")).with_header("accept", "application/json");
    assert_eq!(json.accepts("/api/"), AcceptKind::Json);

    let api = Request::get(url("http://app.test/api/properties"));
    assert_eq!(api.accepts("/api/"), AcceptKind::Json);

    let navigation = Request::get(url("http://app.test/dashboard"));
    assert_eq!(navigation.accepts("/api/"), AcceptKind::Document);

    let image = Request::get(url("http://app.test/img/logo.png")).with_header("accept", "image/*");
    assert_eq!(image.accepts("/api/"), AcceptKind::Other);
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let request = Request::get(url("http://app.test/")).with_header("X-Token", "abc");
    assert_eq!(request.header("x-token"), Some("abc"));
    assert_eq!(request.header("X-TOKEN"), Some("abc"));
  }

  #[test]
  fn test_record_rebuilds_request() {
    let request = Request::new(Method::POST, url("http://app.test/api/calculations"))
      .with_header("content-type", "application/json")
      .with_body(r#"{"price":250000}"#);

    let record = RequestRecord::from(&request);
    let json = serde_json::to_string(&record).unwrap();
    let restored: RequestRecord = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.to_request().unwrap(), request);
  }

  #[test]
  fn test_record_rejects_bad_url() {
    let record = RequestRecord {
      method: "POST".to_string(),
      url: "not a url".to_string(),
      headers: Headers::new(),
      body: None,
    };
    assert!(record.to_request().is_err());
  }
}
