//! Append-only audit trail, one stream per worker name.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, ScanError};
use crate::keys::Keys;
use crate::models::AuditLogEntry;
use crate::store::Store;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Every field is optional; set fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
  pub worker_name: Option<String>,
  pub log_type: Option<String>,
  pub user_id: Option<String>,
  pub username: Option<String>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
  value.as_deref().filter(|v| !v.is_empty())
}

impl AuditFilter {
  pub fn matches(&self, entry: &AuditLogEntry) -> bool {
    non_empty(&self.worker_name).is_none_or(|w| entry.worker_name == w)
      && non_empty(&self.log_type).is_none_or(|t| entry.log_type.as_str() == t)
      && non_empty(&self.user_id).is_none_or(|u| entry.user_id == u)
      && non_empty(&self.username).is_none_or(|u| entry.username == u)
      && self.start_time.is_none_or(|start| entry.timestamp >= start)
      && self.end_time.is_none_or(|end| entry.timestamp <= end)
  }
}

/// Page coordinates after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
  pub page: usize,
  pub page_size: usize,
}

impl PageRequest {
  /// Out of range input is clamped, never rejected.
  pub fn clamped(page: i64, page_size: i64) -> Self {
    let page_size = if page_size > MAX_PAGE_SIZE as i64 {
      MAX_PAGE_SIZE
    } else if page_size < 1 {
      DEFAULT_PAGE_SIZE
    } else {
      page_size as usize
    };
    Self { page: page.max(1) as usize, page_size }
  }
}

impl Default for PageRequest {
  fn default() -> Self {
    Self { page: 1, page_size: DEFAULT_PAGE_SIZE }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
  pub list: Vec<T>,
  pub total: usize,
  pub page: usize,
  pub page_size: usize,
}

#[derive(Clone)]
pub struct AuditLog {
  store: Arc<dyn Store>,
  keys: Keys,
}

impl AuditLog {
  pub fn new(store: Arc<dyn Store>, keys: Keys) -> Self {
    Self { store, keys }
  }

  pub async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
    let key = self.keys.audit(&entry.worker_name);
    let payload = serde_json::to_string(entry)?;
    self.store.xadd(&key, &payload).await.map_err(|e| ScanError::store("xadd", &key, e))?;
    Ok(())
  }

  /// Newest first.
  pub async fn search(&self, filter: &AuditFilter, page: PageRequest) -> Result<Page<AuditLogEntry>> {
    let keys = match non_empty(&filter.worker_name) {
      Some(worker) => vec![self.keys.audit(worker)],
      None => {
        let pattern = self.keys.audit_pattern();
        self.store.keys(&pattern).await.map_err(|e| ScanError::store("keys", &pattern, e))?
      }
    };

    let mut entries = Vec::new();
    for key in &keys {
      let raw = self.store.xrevrange(key, None).await.map_err(|e| ScanError::store("xrevrange", key, e))?;
      for line in raw {
        match serde_json::from_str::<AuditLogEntry>(&line) {
          Ok(entry) if filter.matches(&entry) => entries.push(entry),
          Ok(_) => {}
          Err(e) => warn!("Skipping malformed audit entry in {}: {}", key, e),
        }
      }
    }
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let total = entries.len();
    let list = entries
      .into_iter()
      .skip((page.page - 1).saturating_mul(page.page_size))
      .take(page.page_size)
      .collect();
    Ok(Page { list, total, page: page.page, page_size: page.page_size })
  }

  pub async fn clear_by_worker(&self, worker_name: &str) -> Result<usize> {
    if worker_name.is_empty() {
      return Err(ScanError::Validation("worker name must not be empty".into()));
    }
    let key = self.keys.audit(worker_name);
    let count = self.store.xlen(&key).await.map_err(|e| ScanError::store("xlen", &key, e))?;
    self.store.del(&[key.clone()]).await.map_err(|e| ScanError::store("del", &key, e))?;
    info!("Cleared {} audit entries for worker {}", count, worker_name);
    Ok(count)
  }

  pub async fn clear_all(&self) -> Result<usize> {
    let pattern = self.keys.audit_pattern();
    let keys = self.store.keys(&pattern).await.map_err(|e| ScanError::store("keys", &pattern, e))?;
    let mut count = 0;
    for key in &keys {
      count += self.store.xlen(key).await.map_err(|e| ScanError::store("xlen", key, e))?;
    }
    self.store.del(&keys).await.map_err(|e| ScanError::store("del", &pattern, e))?;
    info!("Cleared {} audit entries across {} streams", count, keys.len());
    Ok(count)
  }
}
