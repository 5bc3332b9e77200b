use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::audit::AuditLog;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::error::{Result, ScanError};
use crate::keys::Keys;
use crate::models::{Actor, AuditLogEntry};
use crate::registry::WorkerRegistry;
use crate::results::ResultStore;
use crate::splitter::TargetSplitter;
use crate::store::Store;
use crate::submit::TaskSubmitter;
use crate::task_queue::TaskQueue;

pub mod audit;
pub mod sse;
pub mod tasks;
pub mod workers;

/// Request bodies carry whole target lists.
const BODY_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
  pub queue: TaskQueue,
  pub registry: WorkerRegistry,
  pub control: ControlPlane,
  pub results: ResultStore,
  pub audit: AuditLog,
  pub submitter: TaskSubmitter,
  pub splitter: TargetSplitter,
}

impl AppState {
  pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
    let keys = Keys::new(config.namespace.clone());
    let control = ControlPlane::new(store.clone(), keys.clone());
    let registry = WorkerRegistry::new(store.clone(), control.clone(), config.registry());
    let queue = TaskQueue::new(store.clone(), &keys);
    let results = ResultStore::new(store.clone(), keys.clone());
    let audit = AuditLog::new(store, keys);
    let splitter = TargetSplitter::new(config.batch_size);
    let submitter = TaskSubmitter::new(queue.clone(), results.clone(), splitter);
    Self { queue, registry, control, results, audit, submitter, splitter }
  }

  /// Audit writes never fail the operation they describe.
  pub async fn record(&self, entry: AuditLogEntry) {
    if let Err(e) = self.audit.append(&entry).await {
      warn!("Failed to write {} audit entry: {}", entry.log_type.as_str(), e);
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
  pub code: u16,
  pub msg: String,
  pub data: Option<T>,
}

fn envelope<T: Serialize>(status: StatusCode, msg: &str, data: Option<T>) -> Response {
  let body = ApiResponse { code: status.as_u16(), msg: msg.to_string(), data };
  warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

pub fn success<T: Serialize>(data: T) -> Response {
  envelope(StatusCode::OK, "success", Some(data))
}

pub fn failure(err: &ScanError) -> Response {
  let status = StatusCode::from_u16(err.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  if status.is_server_error() {
    error!("Request failed: {}", err);
  }
  envelope::<()>(status, &err.to_string(), None)
}

pub fn respond<T: Serialize>(result: Result<T>) -> Response {
  match result {
    Ok(data) => success(data),
    Err(e) => failure(&e),
  }
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

/// Caller identity as forwarded by the fronting gateway.
pub fn with_actor() -> impl Filter<Extract = (Actor,), Error = Rejection> + Clone {
  warp::header::optional::<String>("x-user-id")
    .and(warp::header::optional::<String>("x-username"))
    .map(|user_id: Option<String>, username: Option<String>| Actor {
      user_id: user_id.unwrap_or_default(),
      username: username.unwrap_or_default(),
    })
}

pub fn json_body<T: serde::de::DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
  warp::body::content_length_limit(BODY_LIMIT).and(warp::body::json())
}

async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
  let (status, msg) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "route not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, format!("invalid request body: {e}"))
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(envelope::<()>(status, &msg, None))
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  workers::routes(state.clone())
    .or(tasks::routes(state.clone()))
    .or(audit::routes(state.clone()))
    .or(sse::sse_route(state))
    .recover(handle_rejection)
}


#[cfg(test)]
mod tests {
  use super::test_support::*;
  use super::*;

  #[tokio::test]
  async fn unknown_route_uses_envelope() {
    let (_, state) = state();
    let res = warp::test::request().path("/api/v1/nope").reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body(&res)["code"], 404);
  }

  #[tokio::test]
  async fn malformed_body_is_bad_request() {
    let (_, state) = state();
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/workers/rename")
      .body("{not json")
      .reply(&routes(state))
      .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(body(&res)["data"].is_null());
  }

  #[test]
  fn store_failures_map_to_internal_error() {
    let err = ScanError::store("get", "k", crate::error::StoreError::Backend("down".into()));
    assert_eq!(failure(&err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failure(&ScanError::Conflict("taken".into())).status(), StatusCode::CONFLICT);
  }
}
