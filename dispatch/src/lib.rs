#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]

//! The HTTP dispatch front-end: resolves a dotted method name against a registered task,
//! submits or polls its job, and renders the result as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use fingerprint::Value;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tasks::{JobState, TaskDescriptor, WorkerRuntime};
use tower_http::cors::CorsLayer;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("method {0:?} is not in the configured allow-list")]
  UnauthorizedMethod(String),
  #[error("malformed argument: {0}")]
  MalformedArgument(String),
  #[error(transparent)]
  Tasks(#[from] tasks::Error),
  #[error(transparent)]
  Broker(#[from] broker::Error),
}

#[derive(Serialize)]
struct ErrorEnvelope {
  results: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
  traceback: String,
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = match &self {
      Error::UnauthorizedMethod(_) => StatusCode::FORBIDDEN,
      Error::MalformedArgument(_) => StatusCode::BAD_REQUEST,
      Error::Tasks(_) | Error::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let envelope = ErrorEnvelope {
      results: ErrorBody {
        error: self.to_string(),
        traceback: format!("{self:?}"),
      },
    };
    (status, axum::Json(envelope)).into_response()
  }
}

/// `generate_task_queue://<id>` distinguishes "graph being built" from "graph running", per the
/// queue-tracking map's lifecycle.
const GENERATE_TASK_QUEUE_PREFIX: &str = "generate_task_queue://";

/// Shared dispatch state: the registered tasks, the worker runtime they run on, and the
/// queue-tracking map recording in-flight dispatch keys.
pub struct AppState<B: broker::Broker> {
  descriptors: Mutex<HashMap<String, TaskDescriptor>>,
  runtime: Arc<dyn WorkerRuntime>,
  queue_map: Arc<broker::DistributedMap<B>>,
  allow_list: Vec<Regex>,
}

impl<B: broker::Broker> AppState<B> {
  pub fn new(
    runtime: Arc<dyn WorkerRuntime>,
    queue_map: Arc<broker::DistributedMap<B>>,
    allow_list: Vec<Regex>,
  ) -> AppState<B> {
    AppState {
      descriptors: Mutex::new(HashMap::new()),
      runtime,
      queue_map,
      allow_list,
    }
  }

  pub fn register(&self, descriptor: TaskDescriptor, task: Arc<dyn tasks::RegisteredTask>) {
    self.descriptors.lock().insert(descriptor.name.clone(), descriptor.clone());
    self.runtime.register(descriptor, task);
  }

  fn check_allowed(&self, method: &str) -> Result<(), Error> {
    if self.allow_list.iter().any(|re| re.is_match(method)) {
      Ok(())
    } else {
      Err(Error::UnauthorizedMethod(method.to_string()))
    }
  }
}

pub fn router<B: broker::Broker + 'static>(state: Arc<AppState<B>>) -> Router {
  Router::new()
    .route("/api/help/{*method}", get(help_handler::<B>).post(help_handler::<B>))
    .route("/api/{*method}", get(dispatch_handler::<B>).post(dispatch_handler::<B>))
    .layer(CorsLayer::permissive())
    .with_state(state)
}

fn path_to_method(path: &str) -> String {
  path.trim_matches('/').replace('/', ".")
}

async fn help_handler<B: broker::Broker + 'static>(
  State(state): State<Arc<AppState<B>>>,
  Path(method_path): Path<String>,
) -> Result<impl IntoResponse, Error> {
  let method = path_to_method(&method_path);
  state.check_allowed(&method)?;
  let descriptor = state.descriptors.lock().get(&method).cloned();
  match descriptor {
    Some(d) => Ok(axum::Json(serde_json::json!({
      "name": d.name,
      "queue": d.queue,
      "help": d.help,
      "max_retries": d.retry_policy.max_retries,
    }))),
    None => Ok(axum::Json(serde_json::json!({
      "name": method,
      "help": serde_json::Value::Null,
    }))),
  }
}

#[derive(serde::Serialize)]
#[serde(untagged)]
enum DispatchResponse {
  InProgress { message: String, state: String },
  Success { results: serde_json::Value },
  Failure { results: ErrorBody },
}

async fn dispatch_handler<B: broker::Broker + 'static>(
  State(state): State<Arc<AppState<B>>>,
  Path(method_path): Path<String>,
  Query(query_args): Query<HashMap<String, String>>,
  body: Option<Json<serde_json::Value>>,
) -> Result<impl IntoResponse, Error> {
  let method = path_to_method(&method_path);
  state.check_allowed(&method)?;

  let mut kwargs: HashMap<String, Value> = query_args
    .into_iter()
    .map(|(k, v)| (k, Value::Str(v)))
    .collect();
  if let Some(Json(serde_json::Value::Object(map))) = body {
    for (k, v) in map {
      kwargs.insert(k, Value::from(v));
    }
  }

  let sorted_kwargs: Vec<(String, Value)> = {
    let mut pairs: Vec<(String, Value)> = kwargs.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
  };

  let dispatch_key = fingerprint::key(&method, &[], &sorted_kwargs, &Default::default());

  let job_id = resolve_job_id(&state, &method, &dispatch_key, &sorted_kwargs).await?;
  let job_state = state.runtime.poll(&job_id).await?;

  let response = match &job_state {
    JobState::Success(bytes) => {
      state.queue_map.delete(&dispatch_key).await?;
      let results = serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()));
      DispatchResponse::Success { results }
    }
    JobState::Failure(message) => {
      state.queue_map.delete(&dispatch_key).await?;
      DispatchResponse::Failure {
        results: ErrorBody {
          error: message.clone(),
          traceback: message.clone(),
        },
      }
    }
    JobState::Revoked => {
      state.queue_map.delete(&dispatch_key).await?;
      DispatchResponse::Failure {
        results: ErrorBody {
          error: "task was revoked".to_string(),
          traceback: String::new(),
        },
      }
    }
    JobState::Pending | JobState::Started | JobState::Retry => DispatchResponse::InProgress {
      message: "task is running".to_string(),
      state: format!("{job_state:?}"),
    },
  };

  Ok(axum::Json(response))
}

async fn resolve_job_id<B: broker::Broker + 'static>(
  state: &AppState<B>,
  method: &str,
  dispatch_key: &fingerprint::Key,
  kwargs: &[(String, Value)],
) -> Result<String, Error> {
  if state.queue_map.contains(dispatch_key).await? {
    let recorded: String = state.queue_map.get(dispatch_key).await?;
    if let Some(builder_job_id) = recorded.strip_prefix(GENERATE_TASK_QUEUE_PREFIX) {
      let builder_state = state.runtime.poll(builder_job_id).await?;
      if let JobState::Success(bytes) = builder_state {
        let real_job_id = String::from_utf8_lossy(&bytes).into_owned();
        state.queue_map.set(dispatch_key, &real_job_id).await?;
        return Ok(real_job_id);
      }
      // Still building the graph; surface the builder job itself so the caller sees progress.
      return Ok(builder_job_id.to_string());
    }
    return Ok(recorded);
  }

  let payload = serde_json::to_vec(&serde_json::json!({
    "args": Vec::<serde_json::Value>::new(),
    "kwargs": kwargs.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect::<serde_json::Map<_, _>>(),
  }))
  .map_err(|e| Error::MalformedArgument(e.to_string()))?;

  let is_graph_builder = state
    .descriptors
    .lock()
    .get(method)
    .map(|d| d.is_graph_builder)
    .unwrap_or(false);

  let job_id = state.runtime.submit(method, payload).await?;
  if is_graph_builder {
    state
      .queue_map
      .set(dispatch_key, &format!("{GENERATE_TASK_QUEUE_PREFIX}{job_id}"))
      .await?;
  } else {
    state.queue_map.set(dispatch_key, &job_id).await?;
  }
  Ok(job_id)
}

fn value_to_json(value: &Value) -> serde_json::Value {
  match value {
    Value::Null | Value::RuntimeHandle => serde_json::Value::Null,
    Value::Bool(b) => serde_json::Value::Bool(*b),
    Value::Int(i) => serde_json::Value::Number((*i).into()),
    Value::Float(f) => serde_json::Number::from_f64(*f)
      .map(serde_json::Value::Number)
      .unwrap_or(serde_json::Value::Null),
    Value::Str(s) | Value::Func(s) => serde_json::Value::String(s.clone()),
    Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
    Value::Seq(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
    Value::Map(entries) => {
      let mut map = serde_json::Map::new();
      for (k, v) in entries {
        if let Value::Str(key) = k {
          map.insert(key.clone(), value_to_json(v));
        }
      }
      serde_json::Value::Object(map)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::body::Body;
  use axum::http::Request;
  use broker::InMemoryBroker;
  use tasks::RetryPolicy;
  use tower::ServiceExt;

  struct Immediate;

  #[async_trait::async_trait]
  impl tasks::RegisteredTask for Immediate {
    async fn run(&self, _payload: Vec<u8>) -> Result<Vec<u8>, String> {
      Ok(b"\"ok\"".to_vec())
    }
  }

  fn make_state() -> Arc<AppState<InMemoryBroker>> {
    let runtime = tasks::LocalWorkerRuntime::new(4);
    let broker = InMemoryBroker::new();
    let queue_map = Arc::new(broker::DistributedMap::new(broker, None));
    let allow_list = vec![Regex::new("^pkg\\.mod\\.").unwrap()];
    let state = Arc::new(AppState::new(runtime.clone(), queue_map, allow_list));
    state.register(
      TaskDescriptor {
        name: "pkg.mod.echo".to_string(),
        queue: "default".to_string(),
        retry_policy: RetryPolicy::default(),
        help: Some("echoes its arguments".to_string()),
        is_graph_builder: false,
      },
      Arc::new(Immediate),
    );
    state
  }

  #[tokio::test]
  async fn unauthorized_method_is_rejected() {
    let state = make_state();
    let app = router(state);
    let response = app
      .oneshot(Request::builder().uri("/api/not/allowed").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
  }

  #[tokio::test]
  async fn dispatch_eventually_returns_success() {
    let state = make_state();
    let app = router(state);
    let mut status = StatusCode::OK;
    let mut body_bytes = Vec::new();
    for _ in 0..20 {
      let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/pkg/mod/echo").body(Body::empty()).unwrap())
        .await
        .unwrap();
      status = response.status();
      body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec();
      if String::from_utf8_lossy(&body_bytes).contains("\"results\"") {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body_bytes).contains("ok"));
  }

  #[tokio::test]
  async fn help_route_reports_registered_descriptor() {
    let state = make_state();
    let app = router(state);
    let response = app
      .oneshot(Request::builder().uri("/api/help/pkg/mod/echo").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
  }

  struct ImmediateGraphBuilder {
    real_job_id: String,
  }

  #[async_trait::async_trait]
  impl tasks::RegisteredTask for ImmediateGraphBuilder {
    async fn run(&self, _payload: Vec<u8>) -> Result<Vec<u8>, String> {
      Ok(self.real_job_id.clone().into_bytes())
    }
  }

  #[tokio::test]
  async fn graph_builder_methods_record_a_prefixed_id_that_resolves_to_the_real_job() {
    let runtime = tasks::LocalWorkerRuntime::new(4);
    let broker = InMemoryBroker::new();
    let queue_map = Arc::new(broker::DistributedMap::new(broker, None));
    let allow_list = vec![Regex::new("^pkg\\.mod\\.").unwrap()];
    let state = Arc::new(AppState::new(runtime.clone(), queue_map, allow_list));

    state.register(
      TaskDescriptor {
        name: "pkg.mod.echo".to_string(),
        queue: "default".to_string(),
        retry_policy: RetryPolicy::default(),
        help: None,
        is_graph_builder: false,
      },
      Arc::new(Immediate),
    );
    let real_job_id = runtime
      .submit(
        "pkg.mod.echo",
        serde_json::to_vec(&serde_json::json!({"args": [], "kwargs": {}})).unwrap(),
      )
      .await
      .unwrap();

    state.register(
      TaskDescriptor {
        name: "pkg.mod.graph".to_string(),
        queue: "default".to_string(),
        retry_policy: RetryPolicy::default(),
        help: None,
        is_graph_builder: true,
      },
      Arc::new(ImmediateGraphBuilder {
        real_job_id: real_job_id.clone(),
      }),
    );

    let dispatch_key = fingerprint::key("pkg.mod.graph", &[], &[], &Default::default());
    let builder_job_id = resolve_job_id(&state, "pkg.mod.graph", &dispatch_key, &[]).await.unwrap();
    let recorded: String = state.queue_map.get(&dispatch_key).await.unwrap();
    assert!(
      recorded.starts_with(GENERATE_TASK_QUEUE_PREFIX),
      "expected a generate_task_queue:// id, got {recorded:?}"
    );

    let mut builder_state = state.runtime.poll(&builder_job_id).await.unwrap();
    for _ in 0..50 {
      if matches!(builder_state, JobState::Success(_) | JobState::Failure(_)) {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      builder_state = state.runtime.poll(&builder_job_id).await.unwrap();
    }
    assert!(matches!(builder_state, JobState::Success(_)), "builder ended in {builder_state:?}");

    let resolved = resolve_job_id(&state, "pkg.mod.graph", &dispatch_key, &[]).await.unwrap();
    assert_eq!(resolved, real_job_id);
    let recorded_after: String = state.queue_map.get(&dispatch_key).await.unwrap();
    assert_eq!(recorded_after, real_job_id, "the queue map entry should lose its prefix once resolved");
  }
}
