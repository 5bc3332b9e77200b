use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use warp::reply::Response;
use warp::{Filter, Rejection};

use super::{AppState, failure, json_body, respond, success, with_actor, with_state};
use crate::models::{Actor, AuditLogEntry, AuditLogType};
use crate::splitter::{self, TargetError};
use crate::submit::SubmitTask;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
  pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TargetCheck {
  #[serde(default)]
  pub target: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCheckReport {
  pub count: usize,
  pub need_split: bool,
  pub batch_size: usize,
  pub errors: Vec<TargetError>,
}

pub fn routes(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  let submit = warp::path!("api" / "v1" / "tasks")
    .and(warp::post())
    .and(json_body::<SubmitTask>())
    .and(with_actor())
    .and(with_state(state.clone()))
    .and_then(handle_submit_task);

  let result = warp::path!("api" / "v1" / "tasks" / String / "result")
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(handle_result);

  let logs = warp::path!("api" / "v1" / "tasks" / String / "logs")
    .and(warp::get())
    .and(warp::query::<LogsQuery>())
    .and(with_state(state.clone()))
    .and_then(handle_logs);

  let stop = warp::path!("api" / "v1" / "tasks" / String / "stop")
    .and(warp::post())
    .and(with_actor())
    .and(with_state(state.clone()))
    .and_then(handle_stop);

  let check = warp::path!("api" / "v1" / "targets" / "check")
    .and(warp::post())
    .and(json_body::<TargetCheck>())
    .and(with_state(state))
    .and_then(handle_check);

  submit.or(result).unify().or(logs).unify().or(stop).unify().or(check).unify()
}

async fn handle_submit_task(request: SubmitTask, actor: Actor, state: AppState) -> Result<Response, Rejection> {
  let name = request.name.clone();
  match state.submitter.submit(request).await {
    Ok(outcome) => {
      let message = format!(
        "Submitted task {} with {} targets in {} batch(es)",
        name,
        outcome.target_count,
        outcome.batches
      );
      state
        .record(AuditLogEntry::new(AuditLogType::TaskSubmit, &actor, message).task(&outcome.main_task_id))
        .await;
      Ok(success(outcome))
    }
    Err(e) => Ok(failure(&e)),
  }
}

async fn handle_result(task_id: String, state: AppState) -> Result<Response, Rejection> {
  Ok(respond(state.results.get_result(&task_id).await))
}

async fn handle_logs(task_id: String, query: LogsQuery, state: AppState) -> Result<Response, Rejection> {
  Ok(respond(state.results.task_logs(&task_id, query.limit).await))
}

async fn handle_stop(task_id: String, actor: Actor, state: AppState) -> Result<Response, Rejection> {
  match state.control.stop_task(&task_id).await {
    Ok(()) => {
      let entry = AuditLogEntry::new(AuditLogType::TaskStop, &actor, format!("Stop requested for task {task_id}"))
        .task(&task_id);
      state.record(entry).await;
      Ok(success(json!({ "taskId": task_id })))
    }
    Err(e) => Ok(failure(&e)),
  }
}

async fn handle_check(body: TargetCheck, state: AppState) -> Result<Response, Rejection> {
  let errors = splitter::validate_targets(&body.target);
  let report = TargetCheckReport {
    count: splitter::target_count(&body.target),
    need_split: state.splitter.need_split(&body.target),
    batch_size: state.splitter.batch_size(),
    errors,
  };
  info!("Target check: {} targets, {} errors", report.count, report.errors.len());
  Ok(success(report))
}

#[cfg(test)]
mod tests {
  use super::super::routes;
  use super::super::test_support::{body, state};
  use crate::models::TaskStatus;
  use serde_json::json;
  use warp::http::StatusCode;

  #[tokio::test]
  async fn submit_then_poll_result() {
    let (_, state) = state();
    let api = routes(state.clone());
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/tasks")
      .header("x-user-id", "u7")
      .json(&json!({"name": "edge", "target": "10.0.0.1\n10.0.0.2", "config": {"ports": "80"}}))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::OK);
    let task_id = body(&res)["data"]["mainTaskId"].as_str().unwrap().to_string();
    assert_eq!(state.queue.len().await.unwrap(), 1);

    let res = warp::test::request()
      .path(&format!("/api/v1/tasks/{task_id}/result"))
      .reply(&api)
      .await;
    assert_eq!(body(&res)["data"]["status"], TaskStatus::Running.as_str());
  }

  #[tokio::test]
  async fn invalid_target_is_rejected() {
    let (_, state) = state();
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/tasks")
      .json(&json!({"name": "edge", "target": "10.0.0.0/99"}))
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.queue.len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn unknown_task_reports_not_found_status() {
    let (_, state) = state();
    let res = warp::test::request().path("/api/v1/tasks/missing/result").reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body(&res)["data"]["status"], "NOT_FOUND");
  }

  #[tokio::test]
  async fn stop_flags_task_and_audits() {
    let (_, state) = state();
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/tasks/t9/stop")
      .reply(&routes(state.clone()))
      .await;
    assert_eq!(res.status(), StatusCode::OK);
    let key = state.control.keys().task_ctrl("t9");
    assert!(state.control.check_flag(&key).await.unwrap());
    let audit = state.audit.search(&Default::default(), Default::default()).await.unwrap();
    assert_eq!(audit.list[0].task_id, "t9");
  }

  #[tokio::test]
  async fn target_check_reports_split_and_errors() {
    let (_, state) = state();
    let res = warp::test::request()
      .method("POST")
      .path("/api/v1/targets/check")
      .json(&json!({"target": "10.0.0.0/24\nnot a host!"}))
      .reply(&routes(state))
      .await;
    let body = body(&res);
    assert_eq!(body["data"]["count"], 255);
    assert_eq!(body["data"]["needSplit"], true);
    assert_eq!(body["data"]["errors"][0]["line"], 2);
  }

  #[tokio::test]
  async fn logs_honour_limit() {
    let (_, state) = state();
    let res = warp::test::request().path("/api/v1/tasks/t1/logs?limit=5").reply(&routes(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body(&res)["data"], json!([]));
  }
}
