//! Message protocol between the agent and the pages it serves.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::Agent;

/// A control message as dispatched by the agent. Replies go only to the
/// sender that supplied the reply channel.
#[derive(Debug)]
pub enum ControlMessage {
  /// Promote a waiting generation now
  SkipWaiting,
  GetCacheSize {
    reply: Option<oneshot::Sender<ControlReply>>,
  },
  /// Delete every store
  ClearCache {
    reply: Option<oneshot::Sender<ControlReply>>,
  },
}

/// Wire form of a request, e.g. `{"type":"GET_CACHE_SIZE"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlRequest {
  SkipWaiting,
  GetCacheSize,
  ClearCache,
}

/// Wire form of a reply, e.g. `{"type":"CACHE_SIZE","size":1024}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  CacheSize { size: u64 },
  CacheCleared,
}

impl ControlRequest {
  pub fn from_json(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Invalid control message '{}': {}", raw, e))
  }

  /// Build the message plus the receiving end of its reply channel, if the
  /// request expects a reply.
  pub fn into_message(self) -> (ControlMessage, Option<oneshot::Receiver<ControlReply>>) {
    match self {
      ControlRequest::SkipWaiting => (ControlMessage::SkipWaiting, None),
      ControlRequest::GetCacheSize => {
        let (tx, rx) = oneshot::channel();
        (ControlMessage::GetCacheSize { reply: Some(tx) }, Some(rx))
      }
      ControlRequest::ClearCache => {
        let (tx, rx) = oneshot::channel();
        (ControlMessage::ClearCache { reply: Some(tx) }, Some(rx))
      }
    }
  }
}

/// Deliver a reply if anyone asked for one. A sender that went away is not
/// an error.
pub(crate) fn send_reply(reply: Option<oneshot::Sender<ControlReply>>, message: ControlReply) {
  if let Some(reply) = reply {
    if reply.send(message).is_err() {
      debug!("Control reply dropped, requester went away");
    }
  }
}

/// Handle to a task that feeds control messages to an [`Agent`] one at a
/// time.
#[derive(Clone)]
pub struct ControlChannel {
  tx: mpsc::Sender<ControlMessage>,
}

impl ControlChannel {
  /// Start the dispatch task. It ends when every handle is dropped.
  pub fn spawn(agent: Arc<Agent>) -> (Self, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ControlMessage>(32);

    let handle = tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        if let Err(e) = agent.control(message).await {
          warn!(error = %e, "Control message failed");
        }
      }
      debug!("Control channel closed");
    });

    (Self { tx }, handle)
  }

  pub async fn send(&self, message: ControlMessage) -> Result<()> {
    self
      .tx
      .send(message)
      .await
      .map_err(|_| eyre!("Control channel closed"))
  }

  /// Send a request and wait for its reply. `None` for requests that have
  /// no reply.
  pub async fn request(&self, request: ControlRequest) -> Result<Option<ControlReply>> {
    let (message, reply) = request.into_message();
    self.send(message).await?;

    match reply {
      Some(rx) => rx
        .await
        .map(Some)
        .map_err(|_| eyre!("Control request {:?} was not answered", request)),
      None => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_wire_format() {
    assert_eq!(
      ControlRequest::from_json(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      ControlRequest::SkipWaiting
    );
    assert_eq!(
      ControlRequest::from_json(r#"{"type":"GET_CACHE_SIZE"}"#).unwrap(),
      ControlRequest::GetCacheSize
    );
    assert!(ControlRequest::from_json(r#"{"type":"REBOOT"}"#).is_err());
  }

  #[test]
  fn test_reply_wire_format() {
    assert_eq!(
      serde_json::to_value(ControlReply::CacheSize { size: 1024 }).unwrap(),
      serde_json::json!({"type": "CACHE_SIZE", "size": 1024})
    );
    assert_eq!(
      serde_json::to_value(ControlReply::CacheCleared).unwrap(),
      serde_json::json!({"type": "CACHE_CLEARED"})
    );
  }

  #[tokio::test]
  async fn test_into_message_wires_reply() {
    let (message, rx) = ControlRequest::ClearCache.into_message();
    match message {
      ControlMessage::ClearCache { reply } => send_reply(reply, ControlReply::CacheCleared),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rx.unwrap().await.unwrap(), ControlReply::CacheCleared);

    let (_, rx) = ControlRequest::SkipWaiting.into_message();
    assert!(rx.is_none());
  }
}
