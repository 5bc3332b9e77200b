use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::control::ControlPlane;
use crate::error::Result;
use crate::models::{LogLevel, ResultRecord, Task, TaskLogEntry, TaskStatus};
use crate::results::ResultStore;
use crate::scanner::Scanner;

/// Runs popped tasks through a scanner and records how they ended.
#[derive(Clone)]
pub struct TaskProcessor {
  scanner: Arc<dyn Scanner>,
  results: ResultStore,
  control: ControlPlane,
  flag_poll_interval: Duration,
}

impl TaskProcessor {
  pub fn new(scanner: Arc<dyn Scanner>, results: ResultStore, control: ControlPlane, flag_poll_interval: Duration) -> Self {
    Self { scanner, results, control, flag_poll_interval }
  }

  pub async fn log_message(&self, worker_name: &str, task_id: &str, level: LogLevel, message: &str) {
    let entry = TaskLogEntry {
      timestamp: Utc::now(),
      level,
      worker_name: worker_name.to_string(),
      task_id: task_id.to_string(),
      message: message.to_string(),
    };
    if let Err(e) = self.results.append_task_log(&entry).await {
      warn!("Worker {}: failed to append log for task {}: {}", worker_name, task_id, e);
    }
  }

  async fn stop_requested(&self, flag: &str) -> bool {
    match self.control.check_flag(flag).await {
      Ok(set) => set,
      Err(e) => {
        warn!("Checking stop flag {} failed: {}", flag, e);
        false
      }
    }
  }

  /// Scans the task's targets while watching its stop flag, then writes the
  /// result record. Errors only when the result itself cannot be stored.
  pub async fn process(&self, worker_name: &str, task: &Task) -> Result<TaskStatus> {
    let started = Utc::now();
    let task_id = task.task_id.as_str();
    let targets: Vec<String> = task
      .target
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty() && !line.starts_with('#'))
      .map(str::to_string)
      .collect();

    info!("Worker {}: processing task {} ({} targets)", worker_name, task_id, targets.len());
    self
      .log_message(
        worker_name,
        task_id,
        LogLevel::Info,
        &format!("Started {} scan of {} targets", self.scanner.name(), targets.len()),
      )
      .await;

    let flag = self.control.keys().task_ctrl(task_id);
    let outcome = if self.stop_requested(&flag).await {
      None
    } else {
      tokio::select! {
        scanned = self.scanner.scan(&targets, &task.config) => Some(scanned),
        _ = self.control.wait_for_flag(&flag, self.flag_poll_interval) => None,
      }
    };

    let (status, results, error) = match outcome {
      None => {
        info!("Worker {}: task {} stopped on request", worker_name, task_id);
        self.log_message(worker_name, task_id, LogLevel::Warn, "Task stopped on request").await;
        (TaskStatus::Stopped, Vec::new(), None)
      }
      Some(Ok(assets)) => {
        let message = format!("Completed with {} assets", assets.len());
        self.log_message(worker_name, task_id, LogLevel::Info, &message).await;
        let results = assets.iter().map(serde_json::to_value).collect::<std::result::Result<Vec<_>, _>>()?;
        (TaskStatus::Completed, results, None)
      }
      Some(Err(e)) => {
        let message = format!("{e:#}");
        error!("Worker {}: task {} failed: {}", worker_name, task_id, message);
        self.log_message(worker_name, task_id, LogLevel::Error, &format!("Scan failed: {message}")).await;
        (TaskStatus::Error, Vec::new(), Some(message))
      }
    };

    let record = ResultRecord {
      status: Some(status.as_str().to_string()),
      results,
      error,
      create_time: started,
      update_time: Utc::now(),
    };
    self.results.save_result(task_id, &record).await?;
    Ok(status)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::keys::Keys;
  use crate::scanner::Asset;
  use crate::store::MemoryStore;
  use async_trait::async_trait;

  struct FixedScanner {
    delay: Duration,
    fail: bool,
  }

  #[async_trait]
  impl Scanner for FixedScanner {
    fn name(&self) -> &str {
      "fixed"
    }

    async fn scan(&self, targets: &[String], _config: &str) -> anyhow::Result<Vec<Asset>> {
      tokio::time::sleep(self.delay).await;
      if self.fail {
        anyhow::bail!("engine exited with status 2");
      }
      Ok(targets.iter().map(|t| Asset::new(t, 80)).collect())
    }
  }

  fn processor(delay: Duration, fail: bool) -> (ResultStore, ControlPlane, TaskProcessor) {
    let store = Arc::new(MemoryStore::new());
    let keys = Keys::new("test");
    let results = ResultStore::new(store.clone(), keys.clone());
    let control = ControlPlane::new(store, keys);
    let processor = TaskProcessor::new(
      Arc::new(FixedScanner { delay, fail }),
      results.clone(),
      control.clone(),
      Duration::from_millis(10),
    );
    (results, control, processor)
  }

  fn task() -> Task {
    Task {
      enqueue_ts: 1,
      task_id: "t1".into(),
      main_task_id: "t1".into(),
      workspace_id: "default".into(),
      name: "sweep".into(),
      target: "10.0.0.1\n# skipped\n10.0.0.2\n".into(),
      config: "{}".into(),
      priority: 5,
    }
  }

  #[tokio::test]
  async fn completed_scan_stores_assets() {
    let (results, _, processor) = processor(Duration::ZERO, false);
    assert_eq!(processor.process("w1", &task()).await.unwrap(), TaskStatus::Completed);
    let outcome = results.get_result("t1").await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.results.len(), 2);
    let logs = results.task_logs("t1", None).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].worker_name, "w1");
  }

  #[tokio::test]
  async fn scanner_failure_is_recorded() {
    let (results, _, processor) = processor(Duration::ZERO, true);
    assert_eq!(processor.process("w1", &task()).await.unwrap(), TaskStatus::Error);
    let outcome = results.get_result("t1").await.unwrap();
    assert_eq!(outcome.error.as_deref(), Some("engine exited with status 2"));
    assert_eq!(results.task_logs("t1", Some(1)).await.unwrap()[0].level, LogLevel::Error);
  }

  #[tokio::test]
  async fn stop_flag_interrupts_scan() {
    let (results, control, processor) = processor(Duration::from_secs(30), false);
    let handle = tokio::spawn(async move { processor.process("w1", &task()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    control.stop_task("t1").await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
    assert_eq!(status, TaskStatus::Stopped);
    assert_eq!(results.get_result("t1").await.unwrap().status, TaskStatus::Stopped);
  }

  #[tokio::test]
  async fn preset_flag_skips_scan() {
    let (results, control, processor) = processor(Duration::from_secs(30), false);
    control.stop_task("t1").await.unwrap();
    assert_eq!(processor.process("w1", &task()).await.unwrap(), TaskStatus::Stopped);
    assert!(results.get_result("t1").await.unwrap().results.is_empty());
  }
}
