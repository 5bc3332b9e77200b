use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};
use warp::reply::Response;
use warp::{Filter, Rejection};

use super::{AppState, failure, respond, success, with_state};
use crate::audit::{AuditFilter, PageRequest};

type Query = HashMap<String, String>;

fn text(query: &Query, name: &str) -> Option<String> {
  query.get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Unparseable bounds are dropped rather than rejected.
fn time(query: &Query, name: &str) -> Option<DateTime<Utc>> {
  let raw = text(query, name)?;
  match DateTime::parse_from_rfc3339(&raw) {
    Ok(t) => Some(t.with_timezone(&Utc)),
    Err(e) => {
      debug!("Ignoring {}={:?}: {}", name, raw, e);
      None
    }
  }
}

fn number(query: &Query, name: &str) -> i64 {
  text(query, name).and_then(|v| v.parse().ok()).unwrap_or(0)
}

pub fn filter_from_query(query: &Query) -> AuditFilter {
  AuditFilter {
    worker_name: text(query, "workerName"),
    log_type: text(query, "type"),
    user_id: text(query, "userId"),
    username: text(query, "username"),
    start_time: time(query, "startTime"),
    end_time: time(query, "endTime"),
  }
}

pub fn routes(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  let search = warp::path!("api" / "v1" / "audit")
    .and(warp::get())
    .and(warp::query::<Query>())
    .and(with_state(state.clone()))
    .and_then(handle_search);

  let clear = warp::path!("api" / "v1" / "audit")
    .and(warp::delete())
    .and(warp::query::<Query>())
    .and(with_state(state))
    .and_then(handle_clear);

  search.or(clear).unify()
}

async fn handle_search(query: Query, state: AppState) -> Result<Response, Rejection> {
  let filter = filter_from_query(&query);
  let page = PageRequest::clamped(number(&query, "page"), number(&query, "pageSize"));
  Ok(respond(state.audit.search(&filter, page).await))
}

async fn handle_clear(query: Query, state: AppState) -> Result<Response, Rejection> {
  let cleared = match text(&query, "workerName") {
    Some(worker) => state.audit.clear_by_worker(&worker).await,
    None => state.audit.clear_all().await,
  };
  match cleared {
    Ok(count) => {
      info!("Audit clear removed {} entries", count);
      Ok(success(json!({ "cleared": count })))
    }
    Err(e) => Ok(failure(&e)),
  }
}

#[cfg(test)]
mod tests {
  use super::super::routes;
  use super::super::test_support::{body, state};
  use super::*;
  use crate::models::{Actor, AuditLogEntry, AuditLogType};
  use warp::http::StatusCode;

  async fn seed(state: &AppState) {
    let actor = Actor { user_id: "u1".into(), username: "admin".into() };
    for worker in ["w1", "w1", "w2"] {
      let entry = AuditLogEntry::new(AuditLogType::WorkerStop, &actor, format!("stop {worker}")).worker(worker);
      state.audit.append(&entry).await.unwrap();
    }
  }

  #[test]
  fn bad_times_are_ignored() {
    let query: Query = [("startTime", "yesterday"), ("endTime", "2024-05-01T00:00:00+02:00")]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    let filter = filter_from_query(&query);
    assert!(filter.start_time.is_none());
    assert_eq!(filter.end_time.unwrap().to_rfc3339(), "2024-04-30T22:00:00+00:00");
  }

  #[tokio::test]
  async fn search_pages_and_clamps() {
    let (_, state) = state();
    seed(&state).await;
    let res = warp::test::request()
      .path("/api/v1/audit?workerName=w1&page=0&pageSize=500")
      .reply(&routes(state))
      .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = body(&res);
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["page"], 1);
    assert_eq!(body["data"]["pageSize"], 100);
    assert_eq!(body["data"]["list"][0]["type"], "worker_stop");
  }

  #[tokio::test]
  async fn clear_by_worker_then_all() {
    let (_, state) = state();
    seed(&state).await;
    let api = routes(state);
    let res = warp::test::request().method("DELETE").path("/api/v1/audit?workerName=w1").reply(&api).await;
    assert_eq!(body(&res)["data"]["cleared"], 2);
    let res = warp::test::request().method("DELETE").path("/api/v1/audit").reply(&api).await;
    assert_eq!(body(&res)["data"]["cleared"], 1);
  }
}
