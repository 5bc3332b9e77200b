//! Fleet view over worker heartbeats.
//!
//! Rename and delete are compensating sequences, not transactions. A worker
//! that heartbeats under its old name after `rename` has moved the record but
//! before it has processed the rename broadcast will recreate the old key;
//! the console then shows both names until the old one goes offline.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::Error as _;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::control::ControlPlane;
use crate::error::{Result, ScanError};
use crate::keys::Keys;
use crate::models::{ControlCommand, WorkerStatus, WorkerView};
use crate::store::Store;

static WORKER_NAME_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.@-]{1,64}$").expect("worker name pattern compiles"));

#[derive(Debug, Clone)]
pub struct RegistryConfig {
  pub liveness_window: Duration,
  pub refresh_grace: Duration,
  /// Expiry applied to heartbeat records; `None` keeps them until deleted.
  pub record_ttl: Option<Duration>,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      liveness_window: Duration::from_secs(60),
      refresh_grace: Duration::from_millis(500),
      record_ttl: None,
    }
  }
}

pub fn validate_worker_name(name: &str) -> Result<()> {
  if name.is_empty() {
    return Err(ScanError::Validation("worker name must not be empty".into()));
  }
  if !WORKER_NAME_RE.is_match(name) {
    return Err(ScanError::Validation(format!("invalid worker name '{name}'")));
  }
  Ok(())
}

#[derive(Clone)]
pub struct WorkerRegistry {
  store: Arc<dyn Store>,
  control: ControlPlane,
  config: RegistryConfig,
}

impl WorkerRegistry {
  pub fn new(store: Arc<dyn Store>, control: ControlPlane, config: RegistryConfig) -> Self {
    Self { store, control, config }
  }

  pub fn config(&self) -> &RegistryConfig {
    &self.config
  }

  /// Asks the fleet for fresh heartbeats, waits the grace period, then reads.
  pub async fn list_workers(&self) -> Result<Vec<WorkerView>> {
    self.request_refresh().await;
    tokio::time::sleep(self.config.refresh_grace).await;
    self.snapshot(Utc::now()).await
  }

  pub async fn request_refresh(&self) {
    if let Err(e) = self.control.request_refresh().await {
      warn!("Worker refresh broadcast failed: {}", e);
    }
  }

  /// Current fleet view without prompting workers. Unreadable records are
  /// left out rather than failing the listing.
  pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<Vec<WorkerView>> {
    let pattern = Keys::worker_pattern();
    let keys = self.store.keys(pattern).await.map_err(|e| ScanError::store("keys", pattern, e))?;

    let mut workers = Vec::with_capacity(keys.len());
    for key in keys {
      let data = match self.store.get(&key).await {
        Ok(Some(data)) => data,
        Ok(None) => continue,
        Err(e) => {
          warn!("Skipping worker record {}: {}", key, e);
          continue;
        }
      };
      match serde_json::from_str::<WorkerStatus>(&data) {
        Ok(status) => workers.push(WorkerView::from_status(status, now, self.config.liveness_window)),
        Err(e) => warn!("Skipping malformed worker record {}: {}", key, e),
      }
    }
    workers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(workers)
  }

  pub async fn publish_heartbeat(&self, status: &WorkerStatus) -> Result<()> {
    let key = Keys::worker(&status.worker_name);
    let payload = serde_json::to_string(status)?;
    self
      .store
      .set(&key, &payload, self.config.record_ttl)
      .await
      .map_err(|e| ScanError::store("set", &key, e))?;
    debug!("Heartbeat stored for {}", status.worker_name);
    Ok(())
  }

  /// Removes the status and control records and tells a live process to
  /// stop. Returns how many records were removed.
  pub async fn delete(&self, name: &str) -> Result<usize> {
    if name.is_empty() {
      return Err(ScanError::Validation("worker name must not be empty".into()));
    }
    let command = ControlCommand::Stop { worker_name: name.to_string() };
    if let Err(e) = self.control.send_command(&command).await {
      warn!("Stop broadcast for deleted worker {} failed: {}", name, e);
    }

    let keys = [Keys::worker(name), Keys::worker_ctrl(name)];
    let removed = self.store.del(&keys).await.map_err(|e| ScanError::store("del", &keys[0], e))?;
    info!("Deleted worker {} ({} records)", name, removed);
    Ok(removed)
  }

  pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
    if old_name.is_empty() || new_name.is_empty() {
      return Err(ScanError::Validation("worker name must not be empty".into()));
    }
    if old_name == new_name {
      return Err(ScanError::Validation("new name is the same as the old name".into()));
    }
    validate_worker_name(new_name)?;

    let old_key = Keys::worker(old_name);
    let new_key = Keys::worker(new_name);

    let data = self
      .store
      .get(&old_key)
      .await
      .map_err(|e| ScanError::store("get", &old_key, e))?
      .ok_or_else(|| ScanError::NotFound(format!("worker {old_name}")))?;

    let taken = self.store.exists(&new_key).await.map_err(|e| ScanError::store("exists", &new_key, e))?;
    if taken {
      return Err(ScanError::Conflict(format!("worker name {new_name} is already in use")));
    }

    // Mutate the raw document so fields this build does not know survive.
    let mut record: Value = serde_json::from_str(&data)?;
    let Some(fields) = record.as_object_mut() else {
      return Err(ScanError::Serialization(serde_json::Error::custom(format!(
        "worker record {old_key} is not an object"
      ))));
    };
    fields.insert("workerName".into(), Value::String(new_name.to_string()));
    let payload = serde_json::to_string(&record)?;

    self
      .store
      .set(&new_key, &payload, self.config.record_ttl)
      .await
      .map_err(|e| ScanError::store("set", &new_key, e))?;
    self.store.del(&[old_key.clone()]).await.map_err(|e| ScanError::store("del", &old_key, e))?;

    let command = ControlCommand::Rename { worker_name: old_name.to_string(), new_name: new_name.to_string() };
    if let Err(e) = self.control.send_command(&command).await {
      warn!("Rename broadcast {} -> {} failed: {}", old_name, new_name, e);
    }
    info!("Renamed worker {} to {}", old_name, new_name);
    Ok(())
  }
}
