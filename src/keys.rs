//! Key and channel layout shared by the API, the workers and the dashboard.
//!
//! Worker heartbeat and control keys are deliberately not namespaced so that
//! every deployment sharing a store sees the same fleet.

#[derive(Debug, Clone)]
pub struct Keys {
  namespace: String,
}

impl Keys {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self { namespace: namespace.into() }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn task_queue(&self) -> String {
    format!("{}:task:queue", self.namespace)
  }

  pub fn task_info(&self, task_id: &str) -> String {
    format!("{}:task:info:{task_id}", self.namespace)
  }

  pub fn task_result(&self, task_id: &str) -> String {
    format!("{}:task:result:{task_id}", self.namespace)
  }

  pub fn task_ctrl(&self, task_id: &str) -> String {
    format!("{}:task:ctrl:{task_id}", self.namespace)
  }

  pub fn task_logs(&self, task_id: &str) -> String {
    format!("{}:task:logs:{task_id}", self.namespace)
  }

  pub fn worker_query(&self) -> String {
    format!("{}:worker:query", self.namespace)
  }

  pub fn worker_control(&self) -> String {
    format!("{}:worker:control", self.namespace)
  }

  /// Audit entries without a worker land under `-`.
  pub fn audit(&self, worker_name: &str) -> String {
    let worker = if worker_name.is_empty() { "-" } else { worker_name };
    format!("{}:audit:{worker}", self.namespace)
  }

  pub fn audit_pattern(&self) -> String {
    format!("{}:audit:*", self.namespace)
  }

  pub fn worker(name: &str) -> String {
    format!("worker:{name}")
  }

  pub fn worker_ctrl(name: &str) -> String {
    format!("worker_ctrl:{name}")
  }

  pub fn worker_pattern() -> &'static str {
    "worker:*"
  }
}
