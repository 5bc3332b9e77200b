use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A queue entry. `enqueue_ts` is serialized first so that entries sharing a
/// score order by arrival when the store breaks ties on member bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub enqueue_ts: i64,
  pub task_id: String,
  pub main_task_id: String,
  pub workspace_id: String,
  pub name: String,
  pub target: String,
  /// Scanner specific JSON, carried verbatim.
  pub config: String,
  pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
  pub worker_name: String,
  #[serde(default)]
  pub ip: String,
  #[serde(default)]
  pub cpu_load: f64,
  #[serde(default)]
  pub mem_used: f64,
  #[serde(default)]
  pub tasks_started: u64,
  #[serde(default)]
  pub tasks_executed: u64,
  /// Missing or unreadable times are kept as `None`; such a worker is offline.
  #[serde(default, deserialize_with = "lenient_time", skip_serializing_if = "Option::is_none")]
  pub update_time: Option<DateTime<Utc>>,
}

fn lenient_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
  let raw = Option::<Value>::deserialize(deserializer)?;
  Ok(
    raw
      .as_ref()
      .and_then(Value::as_str)
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|t| t.with_timezone(&Utc)),
  )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Running,
  Offline,
}

/// Console row derived from a heartbeat, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerView {
  pub name: String,
  pub ip: String,
  pub cpu_load: f64,
  pub mem_used: f64,
  pub task_count: u64,
  pub running_count: u64,
  pub status: WorkerState,
  pub update_time: Option<DateTime<Utc>>,
}

impl WorkerView {
  pub fn from_status(status: WorkerStatus, now: DateTime<Utc>, liveness_window: Duration) -> Self {
    let alive = status.update_time.is_some_and(|seen| {
      now.signed_duration_since(seen).to_std().map(|s| s < liveness_window).unwrap_or(true)
    });
    Self {
      running_count: status.tasks_started.saturating_sub(status.tasks_executed),
      task_count: status.tasks_executed,
      status: if alive { WorkerState::Running } else { WorkerState::Offline },
      name: status.worker_name,
      ip: status.ip,
      cpu_load: status.cpu_load,
      mem_used: status.mem_used,
      update_time: status.update_time,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlCommand {
  Stop {
    #[serde(rename = "workerName")]
    worker_name: String,
  },
  Rename {
    #[serde(rename = "workerName")]
    worker_name: String,
    #[serde(rename = "newName")]
    new_name: String,
  },
}

impl ControlCommand {
  pub fn worker_name(&self) -> &str {
    match self {
      ControlCommand::Stop { worker_name } | ControlCommand::Rename { worker_name, .. } => worker_name,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
  Debug,
  Info,
  Warn,
  Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
  pub timestamp: DateTime<Utc>,
  pub level: LogLevel,
  pub worker_name: String,
  pub task_id: String,
  pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLogType {
  TaskSubmit,
  TaskStop,
  WorkerStop,
  WorkerDelete,
  WorkerRename,
  WorkerEvent,
}

impl AuditLogType {
  pub fn as_str(&self) -> &'static str {
    match self {
      AuditLogType::TaskSubmit => "task_submit",
      AuditLogType::TaskStop => "task_stop",
      AuditLogType::WorkerStop => "worker_stop",
      AuditLogType::WorkerDelete => "worker_delete",
      AuditLogType::WorkerRename => "worker_rename",
      AuditLogType::WorkerEvent => "worker_event",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
  #[serde(default)]
  pub user_id: String,
  #[serde(default)]
  pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
  pub id: String,
  pub timestamp: DateTime<Utc>,
  pub level: LogLevel,
  #[serde(rename = "type")]
  pub log_type: AuditLogType,
  #[serde(default)]
  pub worker_name: String,
  #[serde(default)]
  pub task_id: String,
  #[serde(default)]
  pub user_id: String,
  #[serde(default)]
  pub username: String,
  pub message: String,
}

impl AuditLogEntry {
  pub fn new(log_type: AuditLogType, actor: &Actor, message: impl Into<String>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      timestamp: Utc::now(),
      level: LogLevel::Info,
      log_type,
      worker_name: String::new(),
      task_id: String::new(),
      user_id: actor.user_id.clone(),
      username: actor.username.clone(),
      message: message.into(),
    }
  }

  pub fn worker(mut self, name: impl Into<String>) -> Self {
    self.worker_name = name.into();
    self
  }

  pub fn task(mut self, task_id: impl Into<String>) -> Self {
    self.task_id = task_id.into();
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Pending,
  Running,
  Completed,
  Stopped,
  Error,
  NotFound,
}

impl TaskStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Stopped | TaskStatus::Error | TaskStatus::NotFound)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "PENDING",
      TaskStatus::Running => "RUNNING",
      TaskStatus::Completed => "COMPLETED",
      TaskStatus::Stopped => "STOPPED",
      TaskStatus::Error => "ERROR",
      TaskStatus::NotFound => "NOT_FOUND",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  /// Workers have historically written `STARTED` for in-flight tasks.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "PENDING" => Ok(TaskStatus::Pending),
      "STARTED" | "RUNNING" => Ok(TaskStatus::Running),
      "COMPLETED" | "SUCCESS" => Ok(TaskStatus::Completed),
      "STOPPED" => Ok(TaskStatus::Stopped),
      "ERROR" | "FAILURE" => Ok(TaskStatus::Error),
      "NOT_FOUND" => Ok(TaskStatus::NotFound),
      other => Err(format!("unknown task status '{other}'")),
    }
  }
}

/// Written once at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
  pub task_id: String,
  pub main_task_id: String,
  pub workspace_id: String,
  pub task_name: String,
  pub target: String,
  #[serde(default)]
  pub status: String,
  pub create_time: DateTime<Utc>,
}

/// Written once by the worker when the task finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default)]
  pub results: Vec<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub create_time: DateTime<Utc>,
  pub update_time: DateTime<Utc>,
}

/// Externally reported view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
  pub task_id: String,
  pub status: TaskStatus,
  pub results: Vec<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub create_time: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub update_time: Option<String>,
}

impl TaskOutcome {
  pub fn found(&self) -> bool {
    self.status != TaskStatus::NotFound
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeDelta;

  fn status(age_secs: i64, now: DateTime<Utc>) -> WorkerStatus {
    WorkerStatus {
      worker_name: "w1".into(),
      ip: "10.0.0.5".into(),
      cpu_load: 12.5,
      mem_used: 40.0,
      tasks_started: 3,
      tasks_executed: 5,
      update_time: Some(now - TimeDelta::seconds(age_secs)),
    }
  }

  #[test]
  fn liveness_follows_window() {
    let now = Utc::now();
    let window = Duration::from_secs(60);
    assert_eq!(WorkerView::from_status(status(10, now), now, window).status, WorkerState::Running);
    assert_eq!(WorkerView::from_status(status(90, now), now, window).status, WorkerState::Offline);
  }

  #[test]
  fn heartbeat_without_readable_time_is_offline() {
    let now = Utc::now();
    let window = Duration::from_secs(60);
    for raw in [r#"{"workerName":"w1"}"#, r#"{"workerName":"w1","updateTime":"yesterday"}"#] {
      let status: WorkerStatus = serde_json::from_str(raw).unwrap();
      assert_eq!(status.update_time, None);
      let view = WorkerView::from_status(status, now, window);
      assert_eq!(view.status, WorkerState::Offline);
      assert_eq!(view.name, "w1");
    }
  }

  #[test]
  fn running_count_never_negative() {
    let now = Utc::now();
    let view = WorkerView::from_status(status(0, now), now, Duration::from_secs(60));
    assert_eq!(view.running_count, 0);
    assert_eq!(view.task_count, 5);
  }

  #[test]
  fn control_commands_use_wire_names() {
    let cmd = ControlCommand::Rename { worker_name: "w1".into(), new_name: "w2".into() };
    let json = serde_json::to_value(&cmd).unwrap();
    assert_eq!(json, serde_json::json!({"action": "rename", "workerName": "w1", "newName": "w2"}));
    let stop: ControlCommand = serde_json::from_str(r#"{"action":"stop","workerName":"w9"}"#).unwrap();
    assert_eq!(stop.worker_name(), "w9");
  }

  #[test]
  fn legacy_status_names_parse() {
    assert_eq!("STARTED".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
    assert!("bogus".parse::<TaskStatus>().is_err());
  }
}
