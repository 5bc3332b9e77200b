use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::models::{Task, TaskInfo, TaskStatus};
use crate::results::ResultStore;
use crate::splitter::{self, TargetSplitter};
use crate::task_queue::{DEFAULT_PRIORITY, TaskQueue};

pub const DEFAULT_WORKSPACE: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTask {
  pub name: String,
  #[serde(default)]
  pub workspace_id: Option<String>,
  pub target: String,
  /// Scanner settings, kept byte for byte.
  #[serde(default)]
  pub config: Option<Box<RawValue>>,
  #[serde(default)]
  pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
  pub main_task_id: String,
  pub task_ids: Vec<String>,
  pub batches: usize,
  pub target_count: usize,
}

#[derive(Clone)]
pub struct TaskSubmitter {
  queue: TaskQueue,
  results: ResultStore,
  splitter: TargetSplitter,
}

impl TaskSubmitter {
  pub fn new(queue: TaskQueue, results: ResultStore, splitter: TargetSplitter) -> Self {
    Self { queue, results, splitter }
  }

  /// Validates the target, records an info record per batch and then
  /// enqueues one task per batch. A single batch reuses the main task id.
  pub async fn submit(&self, request: SubmitTask) -> Result<SubmitOutcome> {
    if request.name.trim().is_empty() {
      return Err(ScanError::Validation("task name must not be empty".into()));
    }
    let errors = splitter::validate_targets(&request.target);
    if !errors.is_empty() {
      return Err(ScanError::Validation(splitter::format_target_errors(&errors)));
    }
    let target_count = splitter::target_count(&request.target);
    if target_count == 0 {
      return Err(ScanError::Validation("target must contain at least one host".into()));
    }

    let batches = self.splitter.split(&request.target);
    let main_task_id = Uuid::new_v4().to_string();
    let workspace_id = request
      .workspace_id
      .filter(|w| !w.is_empty())
      .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
    let config = request.config.map(|raw| raw.get().to_string()).unwrap_or_else(|| "{}".to_string());
    let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
    let total = batches.len();

    let tasks: Vec<Task> = batches
      .into_iter()
      .enumerate()
      .map(|(idx, batch)| {
        let (task_id, name) = if total == 1 {
          (main_task_id.clone(), request.name.clone())
        } else {
          (Uuid::new_v4().to_string(), format!("{} [{}/{}]", request.name, idx + 1, total))
        };
        Task {
          enqueue_ts: 0,
          task_id,
          main_task_id: main_task_id.clone(),
          workspace_id: workspace_id.clone(),
          name,
          target: batch,
          config: config.clone(),
          priority,
        }
      })
      .collect();

    // Info records first: a failed write must leave nothing queued.
    for task in &tasks {
      self
        .results
        .save_task_info(&TaskInfo {
          task_id: task.task_id.clone(),
          main_task_id: task.main_task_id.clone(),
          workspace_id: task.workspace_id.clone(),
          task_name: task.name.clone(),
          target: task.target.clone(),
          status: TaskStatus::Pending.as_str().to_string(),
          create_time: Utc::now(),
        })
        .await?;
    }

    let mut task_ids = Vec::with_capacity(total);
    for task in tasks {
      let queued = self.queue.enqueue(task).await?;
      task_ids.push(queued.task_id);
    }

    info!("Task {} submitted as {} batch(es) over {} targets", main_task_id, total, target_count);
    Ok(SubmitOutcome { main_task_id, task_ids, batches: total, target_count })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::keys::Keys;
  use crate::store::MemoryStore;
  use crate::store::testing::ScriptedStore;
  use std::sync::Arc;

  fn submitter(batch_size: i64) -> (TaskQueue, ResultStore, TaskSubmitter) {
    let store = Arc::new(MemoryStore::new());
    let keys = Keys::new("test");
    let queue = TaskQueue::new(store.clone(), &keys);
    let results = ResultStore::new(store, keys);
    let submitter = TaskSubmitter::new(queue.clone(), results.clone(), TargetSplitter::new(batch_size));
    (queue, results, submitter)
  }

  fn request(target: &str) -> SubmitTask {
    SubmitTask {
      name: "edge sweep".into(),
      workspace_id: None,
      target: target.into(),
      config: RawValue::from_string(r#"{"ports":"22,80"}"#.to_string()).ok(),
      priority: None,
    }
  }

  #[tokio::test]
  async fn large_targets_fan_out_into_batches() {
    let (queue, results, submitter) = submitter(50);
    let outcome = submitter.submit(request("10.0.0.0/25")).await.unwrap();
    assert_eq!(outcome.target_count, 126);
    assert_eq!(outcome.batches, 3);
    assert_eq!(outcome.task_ids.len(), 3);
    assert_eq!(queue.len().await.unwrap(), 3);

    let first = queue.pop_next().await.unwrap().unwrap();
    assert_eq!(first.main_task_id, outcome.main_task_id);
    assert_eq!(first.name, "edge sweep [1/3]");
    assert_eq!(first.target.lines().count(), 50);
    assert_eq!(first.config, r#"{"ports":"22,80"}"#);
    assert_eq!(results.get_result(&first.task_id).await.unwrap().status, TaskStatus::Running);
  }

  #[tokio::test]
  async fn small_targets_keep_notation_and_id() {
    let (queue, _, submitter) = submitter(50);
    let outcome = submitter.submit(request("192.168.0.0/28\nexample.com")).await.unwrap();
    assert_eq!(outcome.task_ids, vec![outcome.main_task_id.clone()]);
    let task = queue.pop_next().await.unwrap().unwrap();
    assert_eq!(task.target, "192.168.0.0/28\nexample.com");
    assert_eq!(task.workspace_id, DEFAULT_WORKSPACE);
  }

  #[tokio::test]
  async fn invalid_targets_are_rejected_before_enqueue() {
    let (queue, _, submitter) = submitter(50);
    let err = submitter.submit(request("10.0.0.0/40")).await.unwrap_err();
    assert!(matches!(err, ScanError::Validation(_)));
    let err = submitter.submit(request("# only a comment")).await.unwrap_err();
    assert!(matches!(err, ScanError::Validation(_)));
    assert_eq!(queue.len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn config_is_carried_verbatim() {
    let (queue, _, submitter) = submitter(50);
    let raw = r#"{"timeout":500, "id":123456789012345678901234,"ports":"80"}"#;
    let mut task = request("10.0.0.1");
    task.config = Some(RawValue::from_string(raw.to_string()).unwrap());
    submitter.submit(task).await.unwrap();
    assert_eq!(queue.pop_next().await.unwrap().unwrap().config, raw);

    let mut task = request("10.0.0.2");
    task.config = None;
    submitter.submit(task).await.unwrap();
    assert_eq!(queue.pop_next().await.unwrap().unwrap().config, "{}");
  }

  #[test]
  fn config_survives_json_decoding() {
    let body = r#"{"name":"edge","target":"10.0.0.1","config":{"b":1,"a":12345678901234567890123}}"#;
    let task: SubmitTask = serde_json::from_str(body).unwrap();
    assert_eq!(task.config.unwrap().get(), r#"{"b":1,"a":12345678901234567890123}"#);
  }

  #[tokio::test]
  async fn failed_info_write_queues_nothing() {
    let store = Arc::new(ScriptedStore::refusing_set(":task:info:"));
    let keys = Keys::new("test");
    let queue = TaskQueue::new(store.clone(), &keys);
    let results = ResultStore::new(store, keys);
    let submitter = TaskSubmitter::new(queue.clone(), results, TargetSplitter::new(2));
    let err = submitter.submit(request("10.0.0.1\n10.0.0.2\n10.0.0.3")).await.unwrap_err();
    assert!(matches!(err, ScanError::Store { .. }));
    assert_eq!(queue.len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn ipv6_ranges_are_accepted() {
    let (queue, _, submitter) = submitter(50);
    let outcome = submitter.submit(request("fe80::1-fe80::9")).await.unwrap();
    assert_eq!(outcome.target_count, 9);
    assert_eq!(queue.len().await.unwrap(), 1);
  }
}
