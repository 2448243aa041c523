//! Entry point for every outbound request.
//!
//! [`Interceptor::handle`] always produces exactly one response: from the
//! network, a cache store, the write queue acknowledgement, or the fallback
//! provider. It never returns an error and never panics into the caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use reqwest::{Method, StatusCode};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheGeneration, CacheLayer, CacheResult, CacheSource, StoreName};
use crate::error::AgentError;
use crate::fallback::FallbackProvider;
use crate::http::{Request, RequestRecord, Response};
use crate::network::{Network, NetworkError};
use crate::queue::WriteQueue;
use crate::strategy::{Strategy, StrategySelector};

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Cross-origin, or a method that is neither GET nor mutating: straight
  /// to the network
  Bypass,
  /// Same-origin mutating request: forwarded, queued if the network is gone
  Deferrable,
  /// Same-origin GET: through the caching pipeline
  Cached(Strategy),
}

#[derive(Clone)]
pub struct Interceptor {
  origin: Url,
  selector: StrategySelector,
  layer: CacheLayer,
  queue: WriteQueue,
  network: Arc<dyn Network>,
  fallback: FallbackProvider,
}

impl Interceptor {
  pub fn new(
    origin: Url,
    selector: StrategySelector,
    layer: CacheLayer,
    queue: WriteQueue,
    network: Arc<dyn Network>,
    fallback: FallbackProvider,
  ) -> Self {
    Self {
      origin,
      selector,
      layer,
      queue,
      network,
      fallback,
    }
  }

  pub fn route(&self, request: &Request) -> Route {
    if request.url.origin() != self.origin.origin() {
      return Route::Bypass;
    }
    if request.is_mutating() {
      return Route::Deferrable;
    }
    if request.method != Method::GET {
      return Route::Bypass;
    }
    Route::Cached(self.selector.select(&request.url))
  }

  /// Handle one request against the stores of `generation`.
  pub async fn handle(&self, request: &Request, generation: &CacheGeneration) -> CacheResult {
    let outcome = AssertUnwindSafe(self.dispatch(request, generation))
      .catch_unwind()
      .await;

    match outcome {
      Ok(Ok(result)) => result,
      Ok(Err(e)) => {
        debug!(url = %request.url, error = %e, "Serving fallback");
        self.fallback_result(request)
      }
      Err(_) => {
        error!(url = %request.url, "Request handling panicked, serving fallback");
        self.fallback_result(request)
      }
    }
  }

  async fn dispatch(
    &self,
    request: &Request,
    generation: &CacheGeneration,
  ) -> Result<CacheResult, AgentError> {
    match self.route(request) {
      Route::Bypass => {
        debug!(method = %request.method, url = %request.url, "Bypassing cache");
        let response = self.network.fetch(request).await?;
        Ok(CacheResult::new(response, CacheSource::Network))
      }
      Route::Deferrable => self.forward_or_enqueue(request).await,
      Route::Cached(strategy) => {
        debug!(url = %request.url, strategy = %strategy, "Routing request");
        match strategy {
          Strategy::CacheFirst => {
            self
              .layer
              .cache_first(&StoreName::core(generation), request)
              .await
          }
          Strategy::NetworkFirst => {
            self
              .layer
              .network_first(&StoreName::dynamic(generation), request)
              .await
          }
          Strategy::StaleWhileRevalidate => {
            self
              .layer
              .stale_while_revalidate(&StoreName::dynamic(generation), request)
              .await
          }
        }
      }
    }
  }

  /// Send a mutating request; if the network is unreachable or timed out,
  /// persist it for replay and acknowledge with 202. Other transport errors
  /// would fail again on replay and go to the fallback instead.
  async fn forward_or_enqueue(&self, request: &Request) -> Result<CacheResult, AgentError> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(CacheResult::new(response, CacheSource::Network)),
      Err(e @ NetworkError::Other(_)) => Err(e.into()),
      Err(e @ (NetworkError::Offline(_) | NetworkError::Timeout(_))) => {
        let item = self
          .queue
          .enqueue(&RequestRecord::from(request))
          .map_err(AgentError::storage)?;
        info!(item_id = item.id, method = %request.method, url = %request.url, error = %e, "Queued write for replay");

        let body = serde_json::json!({
          "queued": true,
          "id": item.id,
          "offline": true,
        });
        Ok(CacheResult::new(
          Response::json(StatusCode::ACCEPTED, body.to_string()),
          CacheSource::Queued,
        ))
      }
    }
  }

  fn fallback_result(&self, request: &Request) -> CacheResult {
    if request.is_mutating() {
      warn!(url = %request.url, "Mutating request could not be sent or queued");
    }
    CacheResult::new(self.fallback.respond(request), CacheSource::Fallback)
  }
}
