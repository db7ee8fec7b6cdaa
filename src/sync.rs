//! Sync coordinator: drains the pending-mutation queue against the origin.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::net::Origin;
use crate::store::{QueueStatus, Store};

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  /// Transient failures left queued for the next trigger.
  pub failed: usize,
  /// Terminal rejections marked and excluded from future drains.
  pub rejected: usize,
}

pub struct SyncCoordinator<O: Origin> {
  store: Arc<Store>,
  origin: Arc<O>,
}

impl<O: Origin> SyncCoordinator<O> {
  pub fn new(store: Arc<Store>, origin: Arc<O>) -> Self {
    Self { store, origin }
  }

  /// Submit every unsynced mutation in insertion order.
  ///
  /// Failures are isolated per item: one failed submission never blocks the
  /// rest of the batch, and nothing is retried within a single pass. A record
  /// is deleted only after the server confirmed it; a crash between the
  /// confirmation and the delete leaves a synced row that the next drain
  /// purges without resubmitting.
  pub async fn drain(&self) -> Result<DrainReport> {
    let leftovers = self.store.purge_synced()?;
    if leftovers > 0 {
      debug!(leftovers, "purged mutations already confirmed by the server");
    }

    let pending = self.store.list_unsynced()?;
    let mut report = DrainReport::default();
    if pending.is_empty() {
      return Ok(report);
    }

    info!(pending = pending.len(), "draining mutation queue");
    for mutation in &pending {
      report.attempted += 1;
      match self.origin.submit(mutation).await {
        Ok(()) => {
          self.store.mark_synced(&mutation.id)?;
          self.store.delete_mutation(&mutation.id)?;
          report.synced += 1;
          debug!(id = %mutation.id, action = %mutation.action, "mutation synced");
        }
        Err(error) if error.is_retryable() => {
          self.store.record_attempt(&mutation.id, &error.to_string())?;
          report.failed += 1;
          warn!(id = %mutation.id, action = %mutation.action, %error, "submission failed, leaving queued");
        }
        Err(error) => {
          let rejection = EngineError::MutationRejected {
            id: mutation.id,
            reason: error.to_string(),
          };
          self.store.mark_rejected(&mutation.id, &rejection.to_string())?;
          report.rejected += 1;
          warn!(id = %mutation.id, action = %mutation.action, %error, "mutation terminally rejected");
        }
      }
    }

    info!(
      synced = report.synced,
      failed = report.failed,
      rejected = report.rejected,
      "drain finished"
    );
    Ok(report)
  }

  /// Queue counters for the foreground sync indicator.
  pub fn status(&self) -> Result<QueueStatus> {
    self.store.queue_status()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::{FetchError, OriginResponse, ReadRequest, SubmitError};
  use crate::store::PendingMutation;
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::{HashMap, HashSet};
  use std::sync::Mutex;
  use uuid::Uuid;

  /// How the origin double answers submissions for one action kind.
  #[derive(Clone, Copy)]
  enum Answer {
    Accept,
    Transient,
    Reject(u16),
  }

  /// Origin double that records submissions and models the server's
  /// dedup-key contract: an accepted id has its effect applied once.
  #[derive(Default)]
  struct RecordingOrigin {
    answers: Mutex<HashMap<String, Answer>>,
    submissions: Mutex<Vec<(Uuid, String)>>,
    applied: Mutex<HashSet<Uuid>>,
  }

  impl RecordingOrigin {
    fn answer(self, action: &str, answer: Answer) -> Self {
      self.answers.lock().unwrap().insert(action.to_string(), answer);
      self
    }

    fn submissions(&self) -> Vec<(Uuid, String)> {
      self.submissions.lock().unwrap().clone()
    }

    fn applied_count(&self) -> usize {
      self.applied.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl Origin for RecordingOrigin {
    async fn fetch(&self, _request: &ReadRequest) -> std::result::Result<OriginResponse, FetchError> {
      Err(FetchError("not a read origin".to_string()))
    }

    async fn submit(&self, mutation: &PendingMutation) -> std::result::Result<(), SubmitError> {
      self
        .submissions
        .lock()
        .unwrap()
        .push((mutation.id, mutation.action.clone()));

      let answer = self
        .answers
        .lock()
        .unwrap()
        .get(&mutation.action)
        .copied()
        .unwrap_or(Answer::Accept);

      match answer {
        Answer::Accept => {
          self.applied.lock().unwrap().insert(mutation.id);
          Ok(())
        }
        Answer::Transient => Err(SubmitError::Unreachable("connection reset".to_string())),
        Answer::Reject(status) => Err(SubmitError::Rejected {
          status,
          message: "validation failed".to_string(),
        }),
      }
    }

    async fn reachable(&self) -> bool {
      true
    }
  }

  fn coordinator(origin: RecordingOrigin) -> (SyncCoordinator<RecordingOrigin>, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let sc = SyncCoordinator::new(Arc::clone(&store), Arc::new(origin));
    (sc, store)
  }

  #[tokio::test]
  async fn test_drain_deletes_after_confirmed_success() {
    let (sc, store) = coordinator(RecordingOrigin::default());
    store.enqueue(&PendingMutation::new("dose-logged", json!({"med": "m1"}))).unwrap();
    store.enqueue(&PendingMutation::new("entry-added", json!({"note": "ok"}))).unwrap();

    let report = sc.drain().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.synced, 2);
    assert!(store.list_unsynced().unwrap().is_empty());
    assert_eq!(sc.origin.applied_count(), 2);
  }

  #[tokio::test]
  async fn test_drain_isolates_failures_in_order() {
    let origin = RecordingOrigin::default().answer("b", Answer::Transient);
    let (sc, store) = coordinator(origin);

    let a = PendingMutation::new("a", json!(1));
    let b = PendingMutation::new("b", json!(2));
    let c = PendingMutation::new("c", json!(3));
    for m in [&a, &b, &c] {
      store.enqueue(m).unwrap();
    }

    let report = sc.drain().await.unwrap();
    assert_eq!(report, DrainReport { attempted: 3, synced: 2, failed: 1, rejected: 0 });

    // A and C are gone, B stays queued with the failure recorded
    let remaining = store.list_unsynced().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, b.id);
    assert_eq!(remaining[0].attempts, 1);

    // Submissions happened in insertion order
    let actions: Vec<String> = sc.origin.submissions().into_iter().map(|(_, a)| a).collect();
    assert_eq!(actions, vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_terminal_rejection_not_retried() {
    let origin = RecordingOrigin::default().answer("bad", Answer::Reject(422));
    let (sc, store) = coordinator(origin);
    let m = PendingMutation::new("bad", json!({}));
    store.enqueue(&m).unwrap();

    let report = sc.drain().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert!(store.list_unsynced().unwrap().is_empty());

    let rejected = store.list_rejected().unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].last_error.as_deref().unwrap().contains("422"));

    // The next drain does not touch it
    let report = sc.drain().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(sc.origin.submissions().len(), 1);
  }

  #[tokio::test]
  async fn test_crash_between_confirm_and_delete_not_resubmitted() {
    let (sc, store) = coordinator(RecordingOrigin::default());
    let m = PendingMutation::new("dose-logged", json!({}));
    store.enqueue(&m).unwrap();
    // Simulate a crash right after the server confirmed: synced flag set,
    // delete never ran
    store.mark_synced(&m.id).unwrap();

    let report = sc.drain().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert!(sc.origin.submissions().is_empty());
    assert!(store.list_unsynced().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_dedup_key_makes_replay_a_single_effect() {
    // Joint contract with the server: replaying the same client id must not
    // apply the effect twice
    let origin = RecordingOrigin::default();
    let m = PendingMutation::new("dose-logged", json!({}));
    origin.submit(&m).await.unwrap();
    origin.submit(&m).await.unwrap();

    assert_eq!(origin.submissions().len(), 2);
    assert_eq!(origin.applied_count(), 1);
  }

  #[tokio::test]
  async fn test_queue_survives_restart_then_syncs_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");
    let m = PendingMutation::new("dose-logged", json!({"med": "m1"}));

    {
      let store = Store::open(&path).unwrap();
      store.enqueue(&m).unwrap();
      // Process dies before any drain
    }

    let store = Arc::new(Store::open(&path).unwrap());
    let sc = SyncCoordinator::new(Arc::clone(&store), Arc::new(RecordingOrigin::default()));

    let report = sc.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(sc.origin.applied_count(), 1);

    let report = sc.drain().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(sc.origin.submissions().len(), 1);
  }

  #[tokio::test]
  async fn test_status_reflects_queue() {
    let origin = RecordingOrigin::default().answer("b", Answer::Transient);
    let (sc, store) = coordinator(origin);
    store.enqueue(&PendingMutation::new("a", json!(1))).unwrap();
    store.enqueue(&PendingMutation::new("b", json!(2))).unwrap();

    sc.drain().await.unwrap();
    let status = sc.status().unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.rejected, 0);
  }
}
