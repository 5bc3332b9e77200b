use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
  WrongType { key: String },

  #[error("store backend error: {0}")]
  Backend(String),
}

impl From<redis::RedisError> for StoreError {
  fn from(e: redis::RedisError) -> Self {
    StoreError::Backend(e.to_string())
  }
}

#[derive(Debug, Error)]
pub enum ScanError {
  #[error("{0}")]
  Validation(String),

  #[error("{0} not found")]
  NotFound(String),

  #[error("{0}")]
  Conflict(String),

  #[error("store operation {op} on {key} failed: {source}")]
  Store {
    op: &'static str,
    key: String,
    #[source]
    source: StoreError,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl ScanError {
  pub fn store(op: &'static str, key: impl Into<String>, source: StoreError) -> Self {
    ScanError::Store { op, key: key.into(), source }
  }

  /// Status code carried in API envelopes.
  pub fn code(&self) -> u16 {
    match self {
      ScanError::Validation(_) => 400,
      ScanError::NotFound(_) => 404,
      ScanError::Conflict(_) => 409,
      ScanError::Store { .. } | ScanError::Serialization(_) => 500,
    }
  }
}

pub type Result<T> = std::result::Result<T, ScanError>;
