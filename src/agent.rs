//! The agent: wires the stores, the interceptor, the lifecycle manager, the
//! write queue and the notification dispatcher to one event surface.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheGeneration, CacheLayer, CacheResult, CacheStorage, SqliteStorage, StoreName};
use crate::clients::Clients;
use crate::config::Config;
use crate::control::{send_reply, ControlMessage, ControlReply};
use crate::db::Database;
use crate::error::AgentError;
use crate::fallback::FallbackProvider;
use crate::http::{Request, Response};
use crate::interceptor::Interceptor;
use crate::lifecycle::{ActivationReport, LifecycleManager, LifecycleState};
use crate::network::{HttpNetwork, Network};
use crate::notify::{ClickOutcome, Notification, NotificationDispatcher};
use crate::queue::{DrainReport, SyncScheduler, WriteQueue};
use crate::strategy::StrategySelector;

pub struct Agent {
  origin: Url,
  generation: CacheGeneration,
  storage: Arc<dyn CacheStorage>,
  queue: WriteQueue,
  interceptor: Interceptor,
  lifecycle: LifecycleManager,
  sync: SyncScheduler,
  clients: Clients,
  notifications: NotificationDispatcher,
}

impl Agent {
  pub fn new(config: &Config, db: Database, network: Arc<dyn Network>) -> Result<Self> {
    let origin = config.origin()?;
    let generation = config.generation();
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::new(db.clone()));
    let queue = WriteQueue::new(db.clone(), config.queue.max_attempts);
    let clients = Clients::new();

    let interceptor = Interceptor::new(
      origin.clone(),
      StrategySelector::from_config(config),
      CacheLayer::new(Arc::clone(&storage), Arc::clone(&network)),
      queue.clone(),
      Arc::clone(&network),
      FallbackProvider::new(&config.app_name, &config.api_prefix),
    );
    let lifecycle = LifecycleManager::new(
      db,
      Arc::clone(&storage),
      Arc::clone(&network),
      clients.clone(),
      generation.clone(),
      origin.clone(),
      config.core_assets.clone(),
    );
    let sync = SyncScheduler::new(queue.clone(), network);
    let notifications = NotificationDispatcher::new(&config.app_name, origin.clone(), clients.clone());

    // Before the first activation the configured release serves, so its
    // stores must exist for responses to be cached.
    if lifecycle.active_generation()?.is_none() {
      storage.open_store(&StoreName::core(&generation))?;
      storage.open_store(&StoreName::dynamic(&generation))?;
    }

    Ok(Self {
      origin,
      generation,
      storage,
      queue,
      interceptor,
      lifecycle,
      sync,
      clients,
      notifications,
    })
  }

  /// Open the on-disk database and a real HTTP client.
  pub fn open(config: &Config) -> Result<Self> {
    let db = Database::open(&config.database_path()?)?;
    let network = Arc::new(HttpNetwork::new(config.request_timeout())?);
    Self::new(config, db, network)
  }

  pub async fn install(&self) -> Result<LifecycleState, AgentError> {
    self.lifecycle.install().await
  }

  pub async fn activate(&self) -> Result<ActivationReport, AgentError> {
    self.lifecycle.activate().await
  }

  pub fn state(&self) -> Result<LifecycleState, AgentError> {
    self.lifecycle.state()
  }

  /// The generation whose stores answer requests: the activated one, or
  /// this agent's own release before anything was activated.
  pub fn serving_generation(&self) -> CacheGeneration {
    match self.lifecycle.active_generation() {
      Ok(Some(generation)) => generation,
      Ok(None) => self.generation.clone(),
      Err(e) => {
        warn!(error = %e, "Could not read active release, using configured one");
        self.generation.clone()
      }
    }
  }

  /// Answer one request. Background cache work keeps running after this
  /// returns.
  pub async fn handle(&self, request: &Request) -> Response {
    self.handle_detailed(request).await.response
  }

  /// Like [`Agent::handle`], but also reports where the response came from
  /// and hands back the background task.
  pub async fn handle_detailed(&self, request: &Request) -> CacheResult {
    let generation = self.serving_generation();
    self.interceptor.handle(request, &generation).await
  }

  /// Build a request for a path on the agent's origin.
  pub fn request(&self, method: Method, path: &str) -> Result<Request> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
    Ok(Request::new(method, url))
  }

  /// Replay queued writes. Call on every connectivity-restored signal.
  pub async fn connectivity_restored(&self) -> Result<DrainReport> {
    info!("Connectivity restored, draining write queue");
    self.sync.drain().await
  }

  pub fn push(&self, data: &[u8]) -> Result<Notification> {
    self.notifications.push(data)
  }

  pub fn notification_click(&self, id: u64) -> Result<Option<ClickOutcome>> {
    self.notifications.click(id)
  }

  /// Dispatch one control message.
  pub async fn control(&self, message: ControlMessage) -> Result<(), AgentError> {
    match message {
      ControlMessage::SkipWaiting => {
        self.lifecycle.skip_waiting().await?;
      }
      ControlMessage::GetCacheSize { reply } => {
        let size = self.cache_size()?;
        send_reply(reply, ControlReply::CacheSize { size });
      }
      ControlMessage::ClearCache { reply } => {
        self.clear_cache()?;
        send_reply(reply, ControlReply::CacheCleared);
      }
    }
    Ok(())
  }

  /// Total body bytes across every store.
  pub fn cache_size(&self) -> Result<u64, AgentError> {
    self.storage.total_byte_size().map_err(AgentError::storage)
  }

  /// Delete every store. Returns how many were removed.
  pub fn clear_cache(&self) -> Result<usize, AgentError> {
    let mut removed = 0;
    for store in self.storage.list_stores().map_err(AgentError::storage)? {
      if self.storage.delete_store(&store).map_err(AgentError::storage)? {
        removed += 1;
      }
    }
    debug!(removed, "Cleared cache");
    Ok(removed)
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn queue(&self) -> &WriteQueue {
    &self.queue
  }

  pub fn sync(&self) -> &SyncScheduler {
    &self.sync
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn notifications(&self) -> &NotificationDispatcher {
    &self.notifications
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::control::{ControlChannel, ControlRequest};
  use crate::network::mock::MockNetwork;
  use reqwest::StatusCode;

  fn config(release: &str) -> Config {
    Config {
      origin: "http://app.test".to_string(),
      release: release.to_string(),
      ..Config::default()
    }
  }

  fn online_network() -> Arc<MockNetwork> {
    let network = Arc::new(MockNetwork::new());
    for asset in Config::default().core_assets {
      network.route(&asset, 200, &format!("shell {}", asset));
    }
    network
  }

  fn agent(release: &str, db: &Database, network: &Arc<MockNetwork>) -> Agent {
    Agent::new(&config(release), db.clone(), network.clone()).unwrap()
  }

  #[tokio::test]
  async fn test_offline_scenario() {
    let db = Database::open_in_memory().unwrap();
    let network = online_network();
    network.route("/api/calculations", 201, r#"{"saved":true}"#);
    let agent = agent("v1", &db, &network);

    assert_eq!(agent.install().await.unwrap(), LifecycleState::Active);
    let core = agent
      .storage()
      .list_entries(&StoreName::core(&CacheGeneration::new("v1")))
      .unwrap();
    assert_eq!(core.len(), 6);

    network.set_online(false);
    let calls_before = network.call_count();

    let calculator = agent.request(Method::GET, "/calculator").unwrap();
    let result = agent.handle_detailed(&calculator).await;
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.response.text(), "shell /calculator");
    assert_eq!(network.call_count(), calls_before);

    let save = agent
      .request(Method::POST, "/api/calculations")
      .unwrap()
      .with_body(r#"{"price":320000,"rent":1650}"#);
    let result = agent.handle_detailed(&save).await;
    assert_eq!(result.source, CacheSource::Queued);
    assert_eq!(result.response.status, StatusCode::ACCEPTED);
    assert_eq!(agent.queue().len().unwrap(), 1);

    network.set_online(true);
    let report = agent.connectivity_restored().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(agent.queue().is_empty().unwrap());
    assert_eq!(network.calls().last().unwrap(), "POST /api/calculations");
  }

  #[tokio::test]
  async fn test_waiting_generation_does_not_serve() {
    let db = Database::open_in_memory().unwrap();
    let network = online_network();
    let v1 = agent("v1", &db, &network);
    v1.install().await.unwrap();

    let v2 = agent("v2", &db, &network);
    v2.clients()
      .open_window(Url::parse("http://app.test/").unwrap())
      .unwrap();
    // The open client belongs to v1 until v2 claims it
    v2.clients().claim(&CacheGeneration::new("v1")).unwrap();

    assert_eq!(v2.install().await.unwrap(), LifecycleState::Waiting);
    assert_eq!(v2.serving_generation(), CacheGeneration::new("v1"));

    v2.control(ControlMessage::SkipWaiting).await.unwrap();
    assert_eq!(v2.serving_generation(), CacheGeneration::new("v2"));
    assert!(v2
      .storage()
      .list_stores()
      .unwrap()
      .iter()
      .all(|s| s.belongs_to(&CacheGeneration::new("v2"))));
  }

  #[tokio::test]
  async fn test_control_channel_round_trip() {
    let db = Database::open_in_memory().unwrap();
    let network = online_network();
    let agent = Arc::new(agent("v1", &db, &network));
    agent.install().await.unwrap();
    let expected = agent.cache_size().unwrap();
    assert!(expected > 0);

    let (channel, task) = ControlChannel::spawn(Arc::clone(&agent));

    let reply = channel.request(ControlRequest::GetCacheSize).await.unwrap();
    assert_eq!(reply, Some(ControlReply::CacheSize { size: expected }));

    let reply = channel.request(ControlRequest::ClearCache).await.unwrap();
    assert_eq!(reply, Some(ControlReply::CacheCleared));
    assert_eq!(agent.cache_size().unwrap(), 0);
    assert!(agent.storage().list_stores().unwrap().is_empty());

    assert_eq!(channel.request(ControlRequest::SkipWaiting).await.unwrap(), None);

    drop(channel);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_push_and_click_through_agent() {
    let db = Database::open_in_memory().unwrap();
    let agent = agent("v1", &db, &online_network());

    let n = agent
      .push(br#"{"title":"New listing","url":"/listings/42"}"#)
      .unwrap();
    match agent.notification_click(n.id).unwrap() {
      Some(ClickOutcome::Opened(client)) => {
        assert_eq!(client.url.as_str(), "http://app.test/listings/42")
      }
      other => panic!("expected a new client, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_handle_before_install_fills_from_network() {
    let db = Database::open_in_memory().unwrap();
    let network = online_network();
    let agent = agent("v1", &db, &network);

    let request = agent.request(Method::GET, "/app.js").unwrap();
    let response = agent.handle(&request).await;
    assert_eq!(response.text(), "shell /app.js");

    let result = agent.handle_detailed(&request).await;
    assert_eq!(result.source, CacheSource::Cache);
  }
}
