//! Replays queued writes when connectivity returns.

use std::sync::Arc;

use color_eyre::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::network::Network;

use super::store::{FailureOutcome, WriteQueue};

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Items replayed and removed
  pub replayed: usize,
  /// Item whose replay failed and stopped the pass
  pub failed: Option<i64>,
  /// Last item moved to the dead letters during the pass
  pub dead_lettered: Option<i64>,
  /// Items still pending after the pass
  pub remaining: usize,
  /// Another pass was already running; this call did nothing
  pub coalesced: bool,
}

/// Drains the [`WriteQueue`] strictly in order. At most one pass runs at a
/// time; a concurrent call returns immediately with `coalesced` set.
#[derive(Clone)]
pub struct SyncScheduler {
  queue: WriteQueue,
  network: Arc<dyn Network>,
  draining: Arc<Mutex<()>>,
}

impl SyncScheduler {
  pub fn new(queue: WriteQueue, network: Arc<dyn Network>) -> Self {
    Self {
      queue,
      network,
      draining: Arc::new(Mutex::new(())),
    }
  }

  /// Replay from the head until the queue is empty or a replay fails.
  ///
  /// A failed replay (transport error or non-success status) stays at the
  /// head and ends the pass; later items are not attempted. A row whose
  /// payload no longer decodes is dead-lettered at once and the pass goes on.
  pub async fn drain(&self) -> Result<DrainReport> {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("Drain already in progress, coalescing");
      return Ok(DrainReport {
        coalesced: true,
        ..DrainReport::default()
      });
    };

    let mut report = DrainReport::default();

    while let Some(raw) = self.queue.head_raw()? {
      let item = match raw.decode() {
        Ok(item) => item,
        Err(e) => {
          let reason = format!("undecodable payload: {}", e);
          self.queue.dead_letter(raw.id, &reason)?;
          report.dead_lettered = Some(raw.id);
          warn!(item_id = raw.id, error = %e, "Queued write cannot be decoded, dead-lettered");
          continue;
        }
      };

      let replay = match item.payload.to_request() {
        Ok(request) => match self.network.fetch(&request).await {
          Ok(response) if response.is_success() => Ok(()),
          Ok(response) => Err(format!("status {}", response.status)),
          Err(e) => Err(e.to_string()),
        },
        Err(e) => Err(e.to_string()),
      };

      match replay {
        Ok(()) => {
          self.queue.remove(item.id)?;
          report.replayed += 1;
          debug!(item_id = item.id, url = %item.payload.url, "Replayed queued write");
        }
        Err(reason) => {
          let outcome = self.queue.record_failure(item.id, &reason)?;
          let err = AgentError::QueueReplay {
            id: item.id,
            reason,
          };
          report.failed = Some(item.id);
          match outcome {
            FailureOutcome::Retained { attempts } => {
              warn!(item_id = item.id, attempt = attempts, error = %err, "Replay failed, stopping drain");
            }
            FailureOutcome::DeadLettered { attempts } => {
              report.dead_lettered = Some(item.id);
              warn!(item_id = item.id, attempt = attempts, error = %err, "Replay failed for the last time, dead-lettered");
            }
          }
          break;
        }
      }
    }

    report.remaining = self.queue.len()?;
    info!(
      replayed = report.replayed,
      remaining = report.remaining,
      "Drain pass finished"
    );
    Ok(report)
  }

  /// Drain once per connectivity-restored signal. Returns when every sender
  /// is dropped.
  pub async fn listen(&self, mut restored: mpsc::Receiver<()>) {
    while restored.recv().await.is_some() {
      if let Err(e) = self.drain().await {
        warn!(error = %e, "Drain pass aborted");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::{Headers, RequestRecord};
  use crate::network::mock::MockNetwork;

  fn record(path: &str) -> RequestRecord {
    RequestRecord {
      method: "POST".to_string(),
      url: format!("http://app.test{}", path),
      headers: Headers::new(),
      body: Some(b"{}".to_vec()),
    }
  }

  fn scheduler(max_attempts: u32) -> (SyncScheduler, WriteQueue, Arc<MockNetwork>) {
    let queue = WriteQueue::new(Database::open_in_memory().unwrap(), max_attempts);
    let network = Arc::new(MockNetwork::new());
    for path in ["/a", "/b", "/c"] {
      network.route(path, 201, "ok");
    }
    (SyncScheduler::new(queue.clone(), network.clone()), queue, network)
  }

  #[tokio::test]
  async fn test_drain_replays_in_order() {
    let (sync, queue, network) = scheduler(0);
    for path in ["/a", "/b", "/c"] {
      queue.enqueue(&record(path)).unwrap();
    }

    let report = sync.drain().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(network.calls(), vec!["POST /a", "POST /b", "POST /c"]);
  }

  #[tokio::test]
  async fn test_failed_head_blocks_later_items() {
    let (sync, queue, network) = scheduler(0);
    let a = queue.enqueue(&record("/a")).unwrap();
    queue.enqueue(&record("/b")).unwrap();
    queue.enqueue(&record("/c")).unwrap();
    network.fail("/a");

    let report = sync.drain().await.unwrap();
    assert_eq!(report.replayed, 0);
    assert_eq!(report.failed, Some(a.id));
    assert_eq!(report.remaining, 3);
    assert_eq!(network.calls(), vec!["POST /a"]);
    assert_eq!(queue.head().unwrap().unwrap().attempt_count, 1);

    network.heal("/a");
    let report = sync.drain().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(
      network.calls(),
      vec!["POST /a", "POST /a", "POST /b", "POST /c"]
    );
  }

  #[tokio::test]
  async fn test_error_status_counts_as_failure() {
    let (sync, queue, network) = scheduler(0);
    network.route("/a", 500, "boom");
    queue.enqueue(&record("/a")).unwrap();
    queue.enqueue(&record("/b")).unwrap();

    let report = sync.drain().await.unwrap();
    assert!(report.failed.is_some());
    assert_eq!(report.remaining, 2);
    assert_eq!(
      queue.head().unwrap().unwrap().last_error.as_deref(),
      Some("status 500 Internal Server Error")
    );
  }

  #[tokio::test]
  async fn test_dead_letter_unblocks_next_pass() {
    let (sync, queue, network) = scheduler(1);
    let a = queue.enqueue(&record("/a")).unwrap();
    queue.enqueue(&record("/b")).unwrap();
    network.fail("/a");

    let report = sync.drain().await.unwrap();
    assert_eq!(report.dead_lettered, Some(a.id));
    assert_eq!(report.remaining, 1);

    let report = sync.drain().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(queue.is_empty().unwrap());
    assert_eq!(queue.dead_letters().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_undecodable_head_is_dead_lettered_and_drain_continues() {
    let db = Database::open_in_memory().unwrap();
    let queue = WriteQueue::new(db.clone(), 0);
    let network = Arc::new(MockNetwork::new());
    network.route("/b", 201, "ok");
    let sync = SyncScheduler::new(queue.clone(), network.clone());

    let a = queue.enqueue(&record("/a")).unwrap();
    queue.enqueue(&record("/b")).unwrap();
    db.lock()
      .unwrap()
      .execute(
        "UPDATE write_queue SET payload = 'garbage' WHERE id = ?",
        [a.id],
      )
      .unwrap();

    let report = sync.drain().await.unwrap();
    assert_eq!(report.dead_lettered, Some(a.id));
    assert_eq!(report.replayed, 1);
    assert_eq!(report.failed, None);
    assert_eq!(report.remaining, 0);
    assert_eq!(network.calls(), vec!["POST /b"]);

    let dead = queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, a.id);
    assert_eq!(dead[0].record(), None);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_coalesced() {
    let (sync, queue, _network) = scheduler(0);
    queue.enqueue(&record("/a")).unwrap();

    let guard = sync.draining.lock().await;
    let report = sync.drain().await.unwrap();
    assert!(report.coalesced);
    assert_eq!(queue.len().unwrap(), 1);
    drop(guard);

    let report = sync.drain().await.unwrap();
    assert!(!report.coalesced);
    assert_eq!(report.replayed, 1);
  }

  #[tokio::test]
  async fn test_listen_drains_on_reconnect() {
    let (sync, queue, _network) = scheduler(0);
    queue.enqueue(&record("/a")).unwrap();

    let (tx, rx) = mpsc::channel(4);
    let listener = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.listen(rx).await })
    };

    tx.send(()).await.unwrap();
    drop(tx);
    listener.await.unwrap();

    assert!(queue.is_empty().unwrap());
  }
}
