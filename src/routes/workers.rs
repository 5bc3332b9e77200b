use serde::Deserialize;
use serde_json::json;
use warp::reply::Response;
use warp::{Filter, Rejection};

use super::{AppState, failure, json_body, respond, success, with_actor, with_state};
use crate::models::{Actor, AuditLogEntry, AuditLogType};

#[derive(Debug, Deserialize)]
pub struct WorkerName {
  #[serde(default)]
  pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameWorker {
  #[serde(default)]
  pub old_name: String,
  #[serde(default)]
  pub new_name: String,
}

pub fn routes(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  let list = warp::path!("api" / "v1" / "workers")
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(handle_list);

  let delete = warp::path!("api" / "v1" / "workers" / "delete")
    .and(warp::post())
    .and(json_body::<WorkerName>())
    .and(with_actor())
    .and(with_state(state.clone()))
    .and_then(handle_delete);

  let rename = warp::path!("api" / "v1" / "workers" / "rename")
    .and(warp::post())
    .and(json_body::<RenameWorker>())
    .and(with_actor())
    .and(with_state(state.clone()))
    .and_then(handle_rename);

  let stop = warp::path!("api" / "v1" / "workers" / "stop")
    .and(warp::post())
    .and(json_body::<WorkerName>())
    .and(with_actor())
    .and(with_state(state))
    .and_then(handle_stop);

  list.or(delete).unify().or(rename).unify().or(stop).unify()
}

async fn handle_list(state: AppState) -> Result<Response, Rejection> {
  Ok(respond(state.registry.list_workers().await))
}

async fn handle_delete(body: WorkerName, actor: Actor, state: AppState) -> Result<Response, Rejection> {
  match state.registry.delete(&body.name).await {
    Ok(removed) => {
      let entry = AuditLogEntry::new(AuditLogType::WorkerDelete, &actor, format!("Deleted worker {}", body.name))
        .worker(&body.name);
      state.record(entry).await;
      Ok(success(json!({ "removed": removed })))
    }
    Err(e) => Ok(failure(&e)),
  }
}

async fn handle_rename(body: RenameWorker, actor: Actor, state: AppState) -> Result<Response, Rejection> {
  match state.registry.rename(&body.old_name, &body.new_name).await {
    Ok(()) => {
      let message = format!("Renamed worker {} to {}", body.old_name, body.new_name);
      let entry = AuditLogEntry::new(AuditLogType::WorkerRename, &actor, message).worker(&body.new_name);
      state.record(entry).await;
      Ok(success(json!({ "name": body.new_name })))
    }
    Err(e) => Ok(failure(&e)),
  }
}

async fn handle_stop(body: WorkerName, actor: Actor, state: AppState) -> Result<Response, Rejection> {
  match state.control.stop_worker(&body.name).await {
    Ok(()) => {
      let entry = AuditLogEntry::new(AuditLogType::WorkerStop, &actor, format!("Stop requested for worker {}", body.name))
        .worker(&body.name);
      state.record(entry).await;
      Ok(success(json!({ "name": body.name })))
    }
    Err(e) => Ok(failure(&e)),
  }
}

#[cfg(test)]
mod tests {
  use super::super::routes;
  use super::super::test_support::{body, state};
  use crate::audit::{AuditFilter, PageRequest};
  use crate::keys::Keys;
  use crate::models::WorkerStatus;
  use chrono::Utc;
  use serde_json::json;
  use warp::http::StatusCode;

  fn heartbeat(name: &str) -> WorkerStatus {
    WorkerStatus {
      worker_name: name.into(),
      ip: "10.0.0.9".into(),
      cpu_load: 3.0,
      mem_used: 20.0,
      tasks_started: 2,
      tasks_executed: 1,
      update_time: Some(Utc::now()),
    }
  }

  #[tokio::test]
  async fn lists_live_workers() {
    let (_, state) = state();
    state.registry.publish_heartbeat(&heartbeat("scanner-1")).await.unwrap();
    let res = warp::test::request().path("/api/v1/workers").reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = body(&res);
    assert_eq!(body["data"][0]["name"], "scanner-1");
    assert_eq!(body["data"][0]["status"], "running");
    assert_eq!(body["data"][0]["runningCount"], 1);
  }

  #[tokio::test]
  async fn rename_reports_conflict_and_audits_success() {
    let (_, state) = state();
    state.registry.publish_heartbeat(&heartbeat("a")).await.unwrap();
    state.registry.publish_heartbeat(&heartbeat("b")).await.unwrap();
    let api = routes(state.clone());

    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/workers/rename")
      .json(&json!({"oldName": "a", "newName": "b"}))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body(&res)["code"], 409);

    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/workers/rename")
      .header("x-username", "ops")
      .json(&json!({"oldName": "a", "newName": "c"}))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::OK);

    let audit = state.audit.search(&AuditFilter::default(), PageRequest::default()).await.unwrap();
    assert_eq!(audit.total, 1);
    assert_eq!(audit.list[0].worker_name, "c");
    assert_eq!(audit.list[0].username, "ops");
  }

  #[tokio::test]
  async fn stop_sets_worker_flag() {
    let (_, state) = state();
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/workers/stop")
      .json(&json!({"name": "scanner-1"}))
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(state.control.check_flag(&Keys::worker_ctrl("scanner-1")).await.unwrap());
  }

  #[tokio::test]
  async fn delete_requires_name() {
    let (_, state) = state();
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/workers/delete")
      .json(&json!({}))
      .reply(&routes(state))
      .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  }
}
