use thiserror::Error;

use crate::network::NetworkError;

/// Failure classes of the agent. None of them is fatal to the host: every
/// path ends in a cached value, a synthesized fallback, or a queued write.
#[derive(Error, Debug)]
pub enum AgentError {
  #[error("transient network failure: {0}")]
  TransientNetwork(#[from] NetworkError),

  #[error("cache store unreadable: {0}")]
  CacheCorruption(String),

  #[error("installation of release {release} failed: {reason}")]
  InstallationFailure { release: String, reason: String },

  #[error("replay of queued write {id} failed: {reason}")]
  QueueReplay { id: i64, reason: String },

  #[error("storage error: {0}")]
  Storage(String),
}

impl AgentError {
  pub fn storage(err: impl std::fmt::Display) -> Self {
    AgentError::Storage(err.to_string())
  }
}
