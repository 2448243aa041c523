//! Install, activation and purge of cache generations.
//!
//! State is kept in the `agent_state` table, not in memory, so a restarted
//! agent resumes where the previous one left off.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheGeneration, CacheStorage, StoreName};
use crate::clients::Clients;
use crate::db::Database;
use crate::error::AgentError;
use crate::http::{Request, Response};
use crate::network::Network;

const ACTIVE_RELEASE_KEY: &str = "active_release";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Never installed, or the last install failed
  Idle,
  Installing,
  /// Installed, held back while an older generation serves open clients
  Waiting,
  Active,
  /// Replaced by a later release; its stores are gone
  Superseded,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleState::Idle => "idle",
      LifecycleState::Installing => "installing",
      LifecycleState::Waiting => "waiting",
      LifecycleState::Active => "active",
      LifecycleState::Superseded => "superseded",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "idle" => Some(LifecycleState::Idle),
      "installing" => Some(LifecycleState::Installing),
      "waiting" => Some(LifecycleState::Waiting),
      "active" => Some(LifecycleState::Active),
      "superseded" => Some(LifecycleState::Superseded),
      _ => None,
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Stores of other generations that were deleted
  pub purged: Vec<StoreName>,
  /// Clients that changed controller
  pub claimed: usize,
}

#[derive(Clone)]
pub struct LifecycleManager {
  db: Database,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  clients: Clients,
  generation: CacheGeneration,
  origin: Url,
  core_assets: Vec<String>,
}

impl LifecycleManager {
  pub fn new(
    db: Database,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Clients,
    generation: CacheGeneration,
    origin: Url,
    core_assets: Vec<String>,
  ) -> Self {
    Self {
      db,
      storage,
      network,
      clients,
      generation,
      origin,
      core_assets,
    }
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  /// State of this manager's generation.
  pub fn state(&self) -> Result<LifecycleState, AgentError> {
    self.state_of(&self.generation)
  }

  fn state_of(&self, generation: &CacheGeneration) -> Result<LifecycleState, AgentError> {
    let raw = self
      .db
      .get_state(&state_key(generation))
      .map_err(AgentError::storage)?;

    Ok(
      raw
        .as_deref()
        .and_then(LifecycleState::parse)
        .unwrap_or(LifecycleState::Idle),
    )
  }

  fn set_state_of(
    &self,
    generation: &CacheGeneration,
    state: LifecycleState,
  ) -> Result<(), AgentError> {
    debug!(release = %generation, state = %state, "Lifecycle transition");
    self
      .db
      .set_state(&state_key(generation), state.as_str())
      .map_err(AgentError::storage)
  }

  /// The generation that currently serves traffic, if any was activated.
  pub fn active_generation(&self) -> Result<Option<CacheGeneration>, AgentError> {
    Ok(
      self
        .db
        .get_state(ACTIVE_RELEASE_KEY)
        .map_err(AgentError::storage)?
        .map(CacheGeneration::new),
    )
  }

  /// Fetch every core asset and write them into this generation's core
  /// store.
  ///
  /// All-or-nothing: if any asset cannot be fetched (transport error or
  /// non-success status) nothing is written and the previous state is
  /// restored. On success the generation is Waiting, or Active straight away
  /// when no older generation is serving open clients. Reinstalling an
  /// active generation refreshes its core store and leaves it Active.
  pub async fn install(&self) -> Result<LifecycleState, AgentError> {
    let previous = self.state()?;
    self.set_state_of(&self.generation, LifecycleState::Installing)?;
    info!(release = %self.generation, assets = self.core_assets.len(), "Installing");

    let entries = match self.fetch_core_assets().await {
      Ok(entries) => entries,
      Err(reason) => {
        self.set_state_of(&self.generation, previous)?;
        let err = AgentError::InstallationFailure {
          release: self.generation.to_string(),
          reason,
        };
        warn!(error = %err, "Install aborted");
        return Err(err);
      }
    };

    if let Err(e) = self.write_core_store(&entries) {
      if previous == LifecycleState::Idle {
        let store = StoreName::core(&self.generation);
        let cleanup = self
          .storage
          .delete_store(&store)
          .and_then(|_| self.storage.open_store(&store));
        if let Err(cleanup) = cleanup {
          warn!(error = %cleanup, "Failed to remove partially written core store");
        }
      }
      self.set_state_of(&self.generation, previous)?;
      return Err(AgentError::InstallationFailure {
        release: self.generation.to_string(),
        reason: e.to_string(),
      });
    }

    if previous == LifecycleState::Active {
      self.set_state_of(&self.generation, LifecycleState::Active)?;
      info!(release = %self.generation, "Reinstalled active release");
      return Ok(LifecycleState::Active);
    }

    self.set_state_of(&self.generation, LifecycleState::Waiting)?;

    if self.must_wait()? {
      info!(release = %self.generation, "Installed, waiting for open clients to release the old generation");
      return Ok(LifecycleState::Waiting);
    }

    self.activate().await?;
    Ok(LifecycleState::Active)
  }

  async fn fetch_core_assets(&self) -> Result<Vec<CacheEntry>, String> {
    let requests = self
      .core_assets
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| format!("invalid core asset {}: {}", path, e))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let responses = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

    requests
      .iter()
      .zip(responses)
      .map(|(request, response)| match response {
        Ok(response) if response.is_success() => Ok(CacheEntry::from_response(request, &response)),
        Ok(Response { status, .. }) => Err(format!("{} answered {}", request.url, status)),
        Err(e) => Err(format!("{}: {}", request.url, e)),
      })
      .collect()
  }

  fn write_core_store(&self, entries: &[CacheEntry]) -> color_eyre::Result<()> {
    let store = StoreName::core(&self.generation);
    self.storage.open_store(&store)?;
    for entry in entries {
      self.storage.put(&store, entry)?;
    }
    debug!(store = %store, entries = entries.len(), "Core store populated");
    Ok(())
  }

  /// An older generation is serving and there are pages it controls.
  fn must_wait(&self) -> Result<bool, AgentError> {
    let older_active = self
      .active_generation()?
      .is_some_and(|active| active != self.generation);
    let has_clients = !self.clients.is_empty().map_err(AgentError::storage)?;
    Ok(older_active && has_clients)
  }

  /// Promote a Waiting generation without waiting for clients to close.
  /// Returns `None` when there is nothing waiting.
  pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>, AgentError> {
    match self.state()? {
      LifecycleState::Waiting => self.activate().await.map(Some),
      state => {
        debug!(release = %self.generation, state = %state, "Skip waiting ignored");
        Ok(None)
      }
    }
  }

  /// Make this generation the one serving traffic: delete every store of
  /// another generation, open this generation's stores, mark the previous
  /// release superseded, and claim all open clients.
  pub async fn activate(&self) -> Result<ActivationReport, AgentError> {
    match self.state()? {
      LifecycleState::Waiting | LifecycleState::Active => {}
      state => {
        return Err(AgentError::InstallationFailure {
          release: self.generation.to_string(),
          reason: format!("cannot activate from state {}", state),
        });
      }
    }

    let mut report = ActivationReport::default();
    for store in self.storage.list_stores().map_err(AgentError::storage)? {
      if store.belongs_to(&self.generation) {
        continue;
      }
      if self.storage.delete_store(&store).map_err(AgentError::storage)? {
        info!(store = %store, "Purged stale store");
        report.purged.push(store);
      }
    }

    for store in [
      StoreName::core(&self.generation),
      StoreName::dynamic(&self.generation),
    ] {
      self.storage.open_store(&store).map_err(AgentError::storage)?;
    }

    if let Some(previous) = self.active_generation()? {
      if previous != self.generation {
        self.set_state_of(&previous, LifecycleState::Superseded)?;
      }
    }

    self
      .db
      .set_state(ACTIVE_RELEASE_KEY, self.generation.release())
      .map_err(AgentError::storage)?;
    self.set_state_of(&self.generation, LifecycleState::Active)?;

    report.claimed = self
      .clients
      .claim(&self.generation)
      .map_err(AgentError::storage)?;

    info!(
      release = %self.generation,
      purged = report.purged.len(),
      claimed = report.claimed,
      "Activated"
    );
    Ok(report)
  }
}

fn state_key(generation: &CacheGeneration) -> String {
  format!("lifecycle:{}", generation.release())
}
