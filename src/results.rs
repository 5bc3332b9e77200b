//! Task lifecycle records and per-task log streams.
//!
//! A task has two records written by different parties: the info record at
//! submission and the result record when a worker finishes. Neither is ever
//! updated in place, so submitter and worker never race on the same key.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{Result, ScanError};
use crate::keys::Keys;
use crate::models::{ResultRecord, TaskInfo, TaskLogEntry, TaskOutcome, TaskStatus};
use crate::store::Store;

pub const TASK_INFO_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const TASK_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Log streams live as long as the info record of their task.
pub const TASK_LOG_TTL: Duration = TASK_INFO_TTL;

#[derive(Clone)]
pub struct ResultStore {
  store: Arc<dyn Store>,
  keys: Keys,
}

impl ResultStore {
  pub fn new(store: Arc<dyn Store>, keys: Keys) -> Self {
    Self { store, keys }
  }

  pub async fn save_task_info(&self, info: &TaskInfo) -> Result<()> {
    let key = self.keys.task_info(&info.task_id);
    let payload = serde_json::to_string(info)?;
    self.store.set(&key, &payload, Some(TASK_INFO_TTL)).await.map_err(|e| {
      error!("Failed to store info for task {}: {:?}", info.task_id, e);
      ScanError::store("set", &key, e)
    })
  }

  pub async fn save_result(&self, task_id: &str, record: &ResultRecord) -> Result<()> {
    let key = self.keys.task_result(task_id);
    let payload = serde_json::to_string(record)?;
    self.store.set(&key, &payload, Some(TASK_RESULT_TTL)).await.map_err(|e| {
      error!("Failed to store result for task {}: {:?}", task_id, e);
      ScanError::store("set", &key, e)
    })
  }

  /// Resolves the externally reported status of a task.
  pub async fn get_result(&self, task_id: &str) -> Result<TaskOutcome> {
    if task_id.trim().is_empty() {
      return Err(ScanError::Validation("task id must not be empty".into()));
    }

    let result_key = self.keys.task_result(task_id);
    let raw = self.store.get(&result_key).await.map_err(|e| ScanError::store("get", &result_key, e))?;
    if let Some(raw) = raw {
      match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(fields)) => return Ok(outcome_from_result(task_id, &fields)),
        Ok(_) => warn!("Result record {} is not an object, ignoring it", result_key),
        Err(e) => warn!("Result record {} is malformed, ignoring it: {}", result_key, e),
      }
    }

    let info_key = self.keys.task_info(task_id);
    let raw = self.store.get(&info_key).await.map_err(|e| ScanError::store("get", &info_key, e))?;
    let mut outcome = TaskOutcome {
      task_id: task_id.to_string(),
      status: TaskStatus::NotFound,
      results: Vec::new(),
      error: None,
      create_time: None,
      update_time: None,
    };
    let Some(info) = raw.and_then(|raw| serde_json::from_str::<Value>(&raw).ok()) else {
      return Ok(outcome);
    };
    if matches!(str_field(&info, "status").as_deref(), None | Some("") | Some("PENDING") | Some("STARTED")) {
      outcome.status = TaskStatus::Running;
      outcome.create_time = str_field(&info, "createTime");
    }
    Ok(outcome)
  }

  pub async fn append_task_log(&self, entry: &TaskLogEntry) -> Result<()> {
    let key = self.keys.task_logs(&entry.task_id);
    let payload = serde_json::to_string(entry)?;
    self.store.xadd(&key, &payload).await.map_err(|e| ScanError::store("xadd", &key, e))?;
    self.store.expire(&key, TASK_LOG_TTL).await.map_err(|e| ScanError::store("expire", &key, e))?;
    Ok(())
  }

  /// Newest first.
  pub async fn task_logs(&self, task_id: &str, limit: Option<usize>) -> Result<Vec<TaskLogEntry>> {
    let key = self.keys.task_logs(task_id);
    let raw = self.store.xrevrange(&key, limit).await.map_err(|e| ScanError::store("xrevrange", &key, e))?;
    Ok(raw.iter().filter_map(|line| serde_json::from_str(line).ok()).collect())
  }
}

fn str_field(value: &Value, field: &str) -> Option<String> {
  value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn outcome_from_result(task_id: &str, fields: &serde_json::Map<String, Value>) -> TaskOutcome {
  let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);
  let mut error = text("error");
  let status = match text("status").as_deref() {
    None | Some("") => TaskStatus::Completed,
    Some(raw) => raw.parse::<TaskStatus>().unwrap_or_else(|e| {
      warn!("Task {}: {}", task_id, e);
      error.get_or_insert(e);
      TaskStatus::Error
    }),
  };
  TaskOutcome {
    task_id: task_id.to_string(),
    status,
    results: fields.get("results").and_then(Value::as_array).cloned().unwrap_or_default(),
    error,
    create_time: text("createTime"),
    update_time: text("updateTime"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::LogLevel;
  use crate::store::MemoryStore;
  use crate::store::testing::ScriptedStore;
  use chrono::Utc;
  use serde_json::json;

  fn results() -> (Arc<MemoryStore>, ResultStore) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), ResultStore::new(store, Keys::new("test")))
  }

  #[tokio::test]
  async fn started_info_reports_running() {
    let (store, results) = results();
    store
      .set("test:task:info:t1", &json!({"status": "STARTED", "createTime": "2024-01-01T10:00:00Z"}).to_string(), None)
      .await
      .unwrap();
    let outcome = results.get_result("t1").await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Running);
    assert_eq!(outcome.create_time.as_deref(), Some("2024-01-01T10:00:00Z"));
  }

  #[tokio::test]
  async fn finished_info_without_result_is_not_found() {
    let (store, results) = results();
    store.set("test:task:info:t1", r#"{"status":"COMPLETED"}"#, None).await.unwrap();
    assert_eq!(results.get_result("t1").await.unwrap().status, TaskStatus::NotFound);
  }

  #[tokio::test]
  async fn missing_records_report_not_found() {
    let (_, results) = results();
    let outcome = results.get_result("nope").await.unwrap();
    assert_eq!(outcome.status, TaskStatus::NotFound);
    assert!(!outcome.found());
  }

  #[tokio::test]
  async fn result_without_status_is_completed() {
    let (store, results) = results();
    store
      .set("test:task:result:t1", &json!({"results": [{"host": "10.0.0.1", "port": 22}]}).to_string(), None)
      .await
      .unwrap();
    let outcome = results.get_result("t1").await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.results.len(), 1);
  }

  #[tokio::test]
  async fn result_record_wins_over_info() {
    let (_, results) = results();
    let now = Utc::now();
    results
      .save_task_info(&TaskInfo {
        task_id: "t1".into(),
        main_task_id: "t1".into(),
        workspace_id: "default".into(),
        task_name: "scan".into(),
        target: "10.0.0.1".into(),
        status: "PENDING".into(),
        create_time: now,
      })
      .await
      .unwrap();
    results
      .save_result(
        "t1",
        &ResultRecord {
          status: Some("ERROR".into()),
          results: Vec::new(),
          error: Some("scanner crashed".into()),
          create_time: now,
          update_time: now,
        },
      )
      .await
      .unwrap();
    let outcome = results.get_result("t1").await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("scanner crashed"));
  }

  #[tokio::test]
  async fn corrupt_result_falls_back_to_info() {
    let (store, results) = results();
    store.set("test:task:result:t1", "{truncated", None).await.unwrap();
    store.set("test:task:info:t1", r#"{"status":""}"#, None).await.unwrap();
    assert_eq!(results.get_result("t1").await.unwrap().status, TaskStatus::Running);
  }

  #[tokio::test]
  async fn task_logs_read_newest_first() {
    let (_, results) = results();
    for message in ["started", "port scan", "finished"] {
      results
        .append_task_log(&TaskLogEntry {
          timestamp: Utc::now(),
          level: LogLevel::Info,
          worker_name: "w1".into(),
          task_id: "t1".into(),
          message: message.into(),
        })
        .await
        .unwrap();
    }
    let logs = results.task_logs("t1", Some(2)).await.unwrap();
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["finished", "port scan"]);
  }

  #[tokio::test]
  async fn task_logs_expire_with_the_task() {
    let store = Arc::new(ScriptedStore::default());
    let results = ResultStore::new(store.clone(), Keys::new("test"));
    results
      .append_task_log(&TaskLogEntry {
        timestamp: Utc::now(),
        level: LogLevel::Info,
        worker_name: "w1".into(),
        task_id: "t1".into(),
        message: "started".into(),
      })
      .await
      .unwrap();
    assert_eq!(store.expiries(), vec![("test:task:logs:t1".to_string(), TASK_LOG_TTL)]);
  }
}
