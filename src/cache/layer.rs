//! Cache layer that executes the caching strategies against the stores and
//! the network.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;

use super::entry::{CacheEntry, CacheResult, CacheSource};
use super::generation::StoreName;
use super::storage::CacheStorage;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the interceptor and the network. An `Err` from
/// any strategy means neither cache nor network could answer; the caller
/// decides what to synthesize instead.
#[derive(Clone)]
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
}

impl CacheLayer {
  pub fn new(storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
    Self { storage, network }
  }

  /// Serve from `store` when present; otherwise fetch and remember.
  ///
  /// 1. Cache hit - return immediately, no network call
  /// 2. Miss - fetch from network, store on success before returning
  /// 3. Network failure - `Err`
  pub async fn cache_first(
    &self,
    store: &StoreName,
    request: &Request,
  ) -> Result<CacheResult, AgentError> {
    if let Some(entry) = self.lookup(store, &request.key()) {
      return Ok(CacheResult::new(entry.to_response(), CacheSource::Cache));
    }

    let response = self.network.fetch(request).await?;
    self.store_if_success(store, request, &response);
    Ok(CacheResult::new(response, CacheSource::Network))
  }

  /// Prefer the network; fall back to the last good copy in `store`.
  ///
  /// The cache write after a successful fetch runs on a blocking task so the
  /// response is not held up by it.
  pub async fn network_first(
    &self,
    store: &StoreName,
    request: &Request,
  ) -> Result<CacheResult, AgentError> {
    match self.network.fetch(request).await {
      Ok(response) => {
        let mut result = CacheResult::new(response.clone(), CacheSource::Network);
        if response.is_success() {
          let storage = Arc::clone(&self.storage);
          let store = store.clone();
          let entry = CacheEntry::from_response(request, &response);
          result = result.with_background(tokio::task::spawn_blocking(move || {
            write_entry(storage.as_ref(), &store, &entry);
          }));
        } else {
          debug!(url = %request.url, status = %response.status, "Not caching non-success response");
        }
        Ok(result)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");
        match self.lookup(store, &request.key()) {
          Some(entry) => Ok(CacheResult::new(entry.to_response(), CacheSource::Offline)),
          None => Err(e.into()),
        }
      }
    }
  }

  /// Serve the cached copy at once and refresh it in the background; with no
  /// cached copy, wait for the network.
  pub async fn stale_while_revalidate(
    &self,
    store: &StoreName,
    request: &Request,
  ) -> Result<CacheResult, AgentError> {
    if let Some(entry) = self.lookup(store, &request.key()) {
      let handle = self.spawn_revalidation(store.clone(), request.clone());
      return Ok(CacheResult::new(entry.to_response(), CacheSource::StaleCache).with_background(handle));
    }

    let response = self.network.fetch(request).await?;
    self.store_if_success(store, request, &response);
    Ok(CacheResult::new(response, CacheSource::Network))
  }

  /// Detached refresh of one entry. Failures are logged here and go no
  /// further; the caller already has its response.
  fn spawn_revalidation(&self, store: StoreName, request: Request) -> JoinHandle<()> {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.network.fetch(&request).await {
        Ok(response) => layer.store_if_success(&store, &request, &response),
        Err(e) => {
          warn!(url = %request.url, error = %e, "Background revalidation failed");
        }
      }
    })
  }

  /// Read an entry, treating unreadable storage as a miss.
  fn lookup(&self, store: &StoreName, key: &RequestKey) -> Option<CacheEntry> {
    match self.storage.get(store, key) {
      Ok(entry) => entry,
      Err(e) => {
        let err = AgentError::CacheCorruption(e.to_string());
        warn!(store = %store, key = %key, error = %err, "Treating cache read failure as miss");
        None
      }
    }
  }

  /// Error responses are never cached.
  fn store_if_success(&self, store: &StoreName, request: &Request, response: &Response) {
    if !response.is_success() {
      debug!(url = %request.url, status = %response.status, "Not caching non-success response");
      return;
    }

    let entry = CacheEntry::from_response(request, response);
    write_entry(self.storage.as_ref(), store, &entry);
  }
}

/// Opportunistic write. The store may have been purged by an activation
/// while the response was in flight; it is not brought back.
fn write_entry(storage: &dyn CacheStorage, store: &StoreName, entry: &CacheEntry) {
  match storage.put_existing(store, entry) {
    Ok(true) => {}
    Ok(false) => {
      debug!(store = %store, key = %entry.key, "Store no longer exists, dropping write");
    }
    Err(e) => {
      warn!(store = %store, key = %entry.key, error = %e, "Failed to cache network response");
    }
  }
}
