use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::warn;
use warp::reply::Response;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{AppState, failure, with_state};
use crate::error::ScanError;
use crate::results::ResultStore;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn sse_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_state(state))
    .and_then(handle_sse)
}

struct Watch {
  results: ResultStore,
  task_id: String,
  ticker: Interval,
  finished: bool,
}

/// One `status` event per poll; the stream ends after the first terminal
/// status.
async fn next_event(mut watch: Watch) -> Option<(Result<Event, Infallible>, Watch)> {
  if watch.finished {
    return None;
  }
  watch.ticker.tick().await;
  let polled = watch.results.get_result(&watch.task_id).await.and_then(|outcome| {
    let payload = serde_json::to_string(&outcome)?;
    Ok((outcome.status.is_terminal(), payload))
  });
  let event = match polled {
    Ok((terminal, payload)) => {
      watch.finished = terminal;
      Event::default().event("status").data(payload)
    }
    Err(e) => {
      warn!("Status poll for task {} failed: {}", watch.task_id, e);
      Event::default().event("error").data(e.to_string())
    }
  };
  Some((Ok(event), watch))
}

async fn handle_sse(query: HashMap<String, String>, state: AppState) -> Result<Response, Rejection> {
  let Some(task_id) = query.get("task_id").filter(|id| !id.trim().is_empty()).cloned() else {
    return Ok(failure(&ScanError::Validation("missing task_id".into())));
  };

  let mut ticker = tokio::time::interval(POLL_INTERVAL);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  let watch = Watch { results: state.results, task_id, ticker, finished: false };
  let stream = futures::stream::unfold(watch, next_event);

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)).into_response())
}
