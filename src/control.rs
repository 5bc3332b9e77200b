//! Administrative signalling.
//!
//! Broadcasts are a latency optimisation and only reach connected
//! subscribers. The persisted flag is the authority: a long running loop
//! polls its own flag key and stops when it shows up, whether or not it ever
//! saw the broadcast.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::keys::Keys;
use crate::models::ControlCommand;
use crate::store::{Store, Subscription};

pub const STOP_TOKEN: &str = "STOP";
pub const REFRESH_PAYLOAD: &str = "refresh";
pub const TASK_FLAG_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const WORKER_FLAG_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct ControlPlane {
  store: Arc<dyn Store>,
  keys: Keys,
}

impl ControlPlane {
  pub fn new(store: Arc<dyn Store>, keys: Keys) -> Self {
    Self { store, keys }
  }

  pub fn keys(&self) -> &Keys {
    &self.keys
  }

  pub async fn broadcast(&self, channel: &str, payload: &str) -> Result<usize> {
    let delivered = self
      .store
      .publish(channel, payload)
      .await
      .map_err(|e| ScanError::store("publish", channel, e))?;
    debug!("Broadcast on {} reached {} subscribers", channel, delivered);
    Ok(delivered)
  }

  pub async fn send_command(&self, command: &ControlCommand) -> Result<usize> {
    let payload = serde_json::to_string(command)?;
    self.broadcast(&self.keys.worker_control(), &payload).await
  }

  /// Fire and forget: asks every worker to publish its status now.
  pub async fn request_refresh(&self) -> Result<usize> {
    self.broadcast(&self.keys.worker_query(), REFRESH_PAYLOAD).await
  }

  pub async fn set_flag(&self, key: &str, token: &str, ttl: Duration) -> Result<()> {
    self.store.set(key, token, Some(ttl)).await.map_err(|e| ScanError::store("set", key, e))
  }

  pub async fn check_flag(&self, key: &str) -> Result<bool> {
    self.store.exists(key).await.map_err(|e| ScanError::store("exists", key, e))
  }

  pub async fn clear_flag(&self, key: &str) -> Result<bool> {
    let removed = self.store.del(&[key.to_string()]).await.map_err(|e| ScanError::store("del", key, e))?;
    Ok(removed > 0)
  }

  pub async fn stop_task(&self, task_id: &str) -> Result<()> {
    if task_id.trim().is_empty() {
      return Err(ScanError::Validation("task id must not be empty".into()));
    }
    self.set_flag(&self.keys.task_ctrl(task_id), STOP_TOKEN, TASK_FLAG_TTL).await?;
    info!("Stop flag set for task {}", task_id);
    Ok(())
  }

  pub async fn stop_worker(&self, name: &str) -> Result<()> {
    if name.trim().is_empty() {
      return Err(ScanError::Validation("worker name must not be empty".into()));
    }
    self.set_flag(&Keys::worker_ctrl(name), STOP_TOKEN, WORKER_FLAG_TTL).await?;
    let command = ControlCommand::Stop { worker_name: name.to_string() };
    if let Err(e) = self.send_command(&command).await {
      warn!("Stop broadcast for worker {} failed, flag remains authoritative: {}", name, e);
    }
    info!("Stop requested for worker {}", name);
    Ok(())
  }

  /// Decoded control commands; undecodable payloads are skipped.
  pub async fn subscribe_commands(&self) -> Result<BoxStream<'static, ControlCommand>> {
    let channel = self.keys.worker_control();
    let sub = self.store.subscribe(&channel).await.map_err(|e| ScanError::store("subscribe", &channel, e))?;
    Ok(
      sub
        .filter_map(|payload| async move {
          match serde_json::from_str::<ControlCommand>(&payload) {
            Ok(command) => Some(command),
            Err(e) => {
              warn!("Ignoring malformed control payload {:?}: {}", payload, e);
              None
            }
          }
        })
        .boxed(),
    )
  }

  pub async fn subscribe_refresh(&self) -> Result<Subscription> {
    let channel = self.keys.worker_query();
    self.store.subscribe(&channel).await.map_err(|e| ScanError::store("subscribe", &channel, e))
  }

  /// Resolves once `key` is present. Store hiccups are logged and polling
  /// carries on.
  pub async fn wait_for_flag(&self, key: &str, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      match self.check_flag(key).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => warn!("Polling control flag {} failed: {}", key, e),
      }
    }
  }
}
