use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, warn};

use crate::error::{Result, ScanError, StoreError};
use crate::keys::Keys;
use crate::models::Task;
use crate::store::Store;

pub const DEFAULT_PRIORITY: u8 = 5;

/// Scores are `priority * PRIORITY_STRIDE + enqueue millis`; the stride keeps
/// every priority tier above any wall clock millisecond value while staying
/// inside the exactly representable f64 range.
const PRIORITY_STRIDE: f64 = 1e13;

static LAST_ENQUEUE_NANOS: AtomicI64 = AtomicI64::new(0);

/// Wall clock nanoseconds, strictly increasing within this process.
fn next_enqueue_nanos() -> i64 {
  let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
  let prev = LAST_ENQUEUE_NANOS
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
    .unwrap_or(now);
  now.max(prev + 1)
}

pub fn score(task: &Task) -> f64 {
  task.priority as f64 * PRIORITY_STRIDE + (task.enqueue_ts / 1_000_000) as f64
}

#[derive(Clone)]
pub struct TaskQueue {
  store: Arc<dyn Store>,
  key: String,
}

impl TaskQueue {
  pub fn new(store: Arc<dyn Store>, keys: &Keys) -> Self {
    Self { store, key: keys.task_queue() }
  }

  /// Stamps the enqueue time and pushes the task. A queue key left behind
  /// with another type is dropped and recreated once.
  pub async fn enqueue(&self, mut task: Task) -> Result<Task> {
    task.enqueue_ts = next_enqueue_nanos();
    let member = serde_json::to_string(&task)?;
    let score = score(&task);

    match self.store.zadd(&self.key, &member, score).await {
      Ok(()) => {}
      Err(StoreError::WrongType { .. }) => {
        warn!("Queue key {} holds an incompatible type, recreating it", self.key);
        self
          .store
          .del(&[self.key.clone()])
          .await
          .map_err(|e| ScanError::store("del", &self.key, e))?;
        self.store.zadd(&self.key, &member, score).await.map_err(|e| {
          error!("Failed to enqueue task {} after recreating {}: {:?}", task.task_id, self.key, e);
          ScanError::store("zadd", &self.key, e)
        })?;
      }
      Err(e) => {
        error!("Failed to enqueue task {}: {:?}", task.task_id, e);
        return Err(ScanError::store("zadd", &self.key, e));
      }
    }
    debug!("Task {} enqueued with priority {}", task.task_id, task.priority);
    Ok(task)
  }

  /// Pops the next task. An empty queue is `Ok(None)`. Entries that no longer
  /// decode are discarded.
  pub async fn pop_next(&self) -> Result<Option<Task>> {
    loop {
      let popped = self.store.zpopmin(&self.key).await.map_err(|e| ScanError::store("zpopmin", &self.key, e))?;
      let Some((member, _)) = popped else {
        return Ok(None);
      };
      match serde_json::from_str::<Task>(&member) {
        Ok(task) => return Ok(Some(task)),
        Err(e) => warn!("Dropping undecodable queue entry from {}: {}", self.key, e),
      }
    }
  }

  pub async fn len(&self) -> Result<usize> {
    self.store.zcard(&self.key).await.map_err(|e| ScanError::store("zcard", &self.key, e))
  }
}
