//! HTTP control surface for the container dependency controller.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::Query;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use crate::block::BlockGate;
use crate::config::ControllerConfig;
use crate::docker::SaltDocker;
use crate::engine::ContainerEngine;
use crate::graph::DependencyGraph;
use crate::jobs::{JobKind, JobManager, JobStatus};
use crate::orchestrate::{self, Outcome};

/// Shared state behind the HTTP handlers.
pub struct AppState<E> {
    pub engine: Arc<E>,
    pub jobs: Arc<JobManager>,
    pub gate: Arc<BlockGate>,
    pub ready: Arc<AtomicBool>,
    pub default_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            jobs: Arc::clone(&self.jobs),
            gate: Arc::clone(&self.gate),
            ready: Arc::clone(&self.ready),
            default_timeout: self.default_timeout,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<E: ContainerEngine> AppState<E> {
    pub fn new(engine: E, default_timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            engine: Arc::new(engine),
            jobs: Arc::new(JobManager::new()),
            gate: Arc::new(BlockGate::new()),
            ready: Arc::new(AtomicBool::new(false)),
            default_timeout,
            shutdown,
        }
    }
}

pub fn router<E: ContainerEngine>(state: AppState<E>) -> Router {
    Router::new()
        .route("/ping", get(ping::<E>))
        .route("/start", post(start::<E>))
        .route("/stop", post(stop::<E>))
        .route("/job_status/{job_id}", get(job_status::<E>))
        .route("/block/{duration_minutes}", post(block::<E>))
        .route("/unblock", post(unblock::<E>))
        .with_state(state)
}

/// Connect to the engine, then serve the control surface until shutdown.
/// Jobs still pending or running at shutdown are abandoned.
pub async fn serve(config: &ControllerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let docker = SaltDocker::connect().await?;

    let state = AppState::new(docker, config.default_timeout(), shutdown.clone());
    state.ready.store(true, Ordering::SeqCst);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    tracing::info!("Controller listening on {}", config.bind);

    let mut shutdown = shutdown;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await
        .context("HTTP server error")?;

    tracing::info!("Application shutdown complete");
    Ok(())
}

async fn ping<E: ContainerEngine>(State(state): State<AppState<E>>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        Json(json!({"message": "pong"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "Application not ready"})),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    /// Wall-clock budget for the traversal, in seconds.
    timeout: Option<u64>,
}

async fn start<E: ContainerEngine>(
    State(state): State<AppState<E>>,
    Query(params): Query<StartParams>,
) -> Response {
    if state.gate.is_blocked() {
        return blocked_response();
    }
    let timeout = timeout_from(&state, params.timeout);

    let graph = match build_graph(&state).await {
        Ok(graph) => graph,
        Err(response) => return response,
    };

    let job_id = state.jobs.create(JobKind::Start, timeout);
    let jobs = Arc::clone(&state.jobs);
    let engine = Arc::clone(&state.engine);
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        jobs.update(job_id, JobStatus::Running);
        let mut graph = graph;
        match orchestrate::start_in_dependency_order(engine.as_ref(), &mut graph, timeout, &shutdown)
            .await
        {
            Ok(Outcome::Completed) => jobs.update(job_id, JobStatus::Completed),
            Ok(Outcome::Aborted) => {
                tracing::info!("Start job {job_id} abandoned at shutdown");
            }
            Err(err) => {
                tracing::error!("Failed to start containers: {err:#}");
                jobs.update(job_id, JobStatus::Failed);
            }
        }
    });

    Json(json!({"job_id": job_id})).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct StopParams {
    /// Container names excluded from this stop run.
    #[serde(default)]
    ignore: Vec<String>,
    /// Wall-clock budget for the traversal, in seconds.
    timeout: Option<u64>,
}

async fn stop<E: ContainerEngine>(
    State(state): State<AppState<E>>,
    Query(params): Query<StopParams>,
) -> Response {
    if state.gate.is_blocked() {
        return blocked_response();
    }
    let timeout = timeout_from(&state, params.timeout);
    let ignore: HashSet<String> = params.ignore.into_iter().collect();

    let graph = match build_graph(&state).await {
        Ok(graph) => graph,
        Err(response) => return response,
    };

    let job_id = state.jobs.create(JobKind::Stop, timeout);
    let jobs = Arc::clone(&state.jobs);
    let engine = Arc::clone(&state.engine);
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        jobs.update(job_id, JobStatus::Running);
        match orchestrate::stop_in_dependency_order(
            engine.as_ref(),
            &graph,
            &ignore,
            timeout,
            &shutdown,
        )
        .await
        {
            Ok(Outcome::Completed) => jobs.update(job_id, JobStatus::Completed),
            Ok(Outcome::Aborted) => {
                tracing::info!("Stop job {job_id} abandoned at shutdown");
            }
            Err(err) => {
                tracing::error!("Failed to stop containers: {err:#}");
                jobs.update(job_id, JobStatus::Failed);
            }
        }
    });

    Json(json!({"job_id": job_id})).into_response()
}

async fn job_status<E: ContainerEngine>(
    State(state): State<AppState<E>>,
    Path(job_id): Path<String>,
) -> Response {
    let status = Uuid::parse_str(&job_id)
        .ok()
        .and_then(|id| state.jobs.status(id));
    match status {
        Some(status) => Json(json!({"status": status})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found"})),
        )
            .into_response(),
    }
}

async fn block<E: ContainerEngine>(
    State(state): State<AppState<E>>,
    Path(duration_minutes): Path<u64>,
) -> Response {
    state
        .gate
        .block(Duration::from_secs(duration_minutes * 60));
    tracing::info!("Operations are now blocked for {duration_minutes} minutes");
    Json(json!({
        "message": format!("Operations are now blocked for {duration_minutes} minutes")
    }))
    .into_response()
}

async fn unblock<E: ContainerEngine>(State(state): State<AppState<E>>) -> Response {
    state.gate.unblock();
    tracing::info!("Operations are now unblocked");
    Json(json!({"message": "Operations are now unblocked"})).into_response()
}

/// The block gate answers with a soft 200 so legacy callers keep working.
fn blocked_response() -> Response {
    (StatusCode::OK, Json(json!({"detail": "Operation blocked"}))).into_response()
}

fn timeout_from<E>(state: &AppState<E>, requested: Option<u64>) -> Duration {
    requested
        .map(Duration::from_secs)
        .unwrap_or(state.default_timeout)
}

/// Build a fresh graph for this request. Engine failures map to 500, bad
/// label values to 400; neither aborts the daemon.
async fn build_graph<E: ContainerEngine>(
    state: &AppState<E>,
) -> std::result::Result<DependencyGraph, Response> {
    let views = match state.engine.list_managed().await {
        Ok(views) => views,
        Err(err) => {
            tracing::error!("Failed to list managed containers: {err:#}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Failed to query the container engine"})),
            )
                .into_response());
        }
    };
    DependencyGraph::build(&views).map_err(|err| {
        tracing::warn!("Rejecting request: {err}");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": err.to_string()})),
        )
            .into_response()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerView;
    use crate::graph::{DELAY_LABEL, DEPENDS_ON_LABEL};
    use crate::testutil::MockEngine;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn view(name: &str, labels: &[(&str, &str)]) -> ContainerView {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ContainerView::new(name, labels)
    }

    fn test_state(engine: MockEngine) -> AppState<MockEngine> {
        let (_, shutdown) = watch::channel(false);
        let state = AppState::new(engine, Duration::from_secs(600), shutdown);
        state.ready.store(true, Ordering::SeqCst);
        state
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn request(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        (status, response_json(response.into_response()).await)
    }

    #[tokio::test]
    async fn ping_answers_pong_when_ready() {
        let app = router(test_state(MockEngine::default()));
        let (status, body) = request(&app, "GET", "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "pong");
    }

    #[tokio::test]
    async fn ping_answers_503_before_initialization() {
        let state = test_state(MockEngine::default());
        state.ready.store(false, Ordering::SeqCst);
        let app = router(state);
        let (status, body) = request(&app, "GET", "/ping").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"], "Application not ready");
    }

    #[tokio::test(start_paused = true)]
    async fn start_returns_a_job_that_completes() {
        let engine = MockEngine::with_views(vec![
            view("a", &[]),
            view("b", &[(DEPENDS_ON_LABEL, "a")]),
        ]);
        let state = test_state(engine);
        let jobs = Arc::clone(&state.jobs);
        let app = router(state);

        let (status, body) = request(&app, "POST", "/start").await;
        assert_eq!(status, StatusCode::OK);
        let job_id: Uuid = body["job_id"]
            .as_str()
            .expect("job id")
            .parse()
            .expect("uuid");

        // Let the background traversal run to completion.
        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(jobs.status(job_id), Some(JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_honours_the_ignore_list() {
        let engine = MockEngine::with_views(vec![
            view("a", &[]),
            view("b", &[(DEPENDS_ON_LABEL, "a")]),
        ]);
        let state = test_state(engine);
        let engine = Arc::clone(&state.engine);
        let jobs = Arc::clone(&state.jobs);
        let app = router(state);

        let (status, body) = request(&app, "POST", "/stop?ignore=b&timeout=60").await;
        assert_eq!(status, StatusCode::OK);
        let job_id: Uuid = body["job_id"]
            .as_str()
            .expect("job id")
            .parse()
            .expect("uuid");

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(jobs.status(job_id), Some(JobStatus::Completed));
        assert_eq!(engine.stop_batches(), vec![vec!["a".to_string()]]);
    }

    #[tokio::test]
    async fn bad_delay_label_yields_400() {
        let engine =
            MockEngine::with_views(vec![view("a", &[(DELAY_LABEL, "not-a-number")])]);
        let app = router(test_state(engine));

        let (status, body) = request(&app, "POST", "/start").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body["detail"].as_str().expect("detail").contains("not-a-number"),
            "{body}"
        );
    }

    #[tokio::test]
    async fn blocked_gate_yields_sentinel_and_no_job() {
        let state = test_state(MockEngine::default());
        state.gate.block(Duration::from_secs(600));
        let app = router(state);

        let (status, body) = request(&app, "POST", "/start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"], "Operation blocked");
        assert!(body.get("job_id").is_none());

        let (status, body) = request(&app, "POST", "/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"], "Operation blocked");
    }

    #[tokio::test]
    async fn block_and_unblock_roundtrip() {
        let state = test_state(MockEngine::default());
        let gate = Arc::clone(&state.gate);
        let app = router(state);

        let (status, body) = request(&app, "POST", "/block/10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["message"],
            "Operations are now blocked for 10 minutes"
        );
        assert!(gate.is_blocked());

        let (status, body) = request(&app, "POST", "/unblock").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Operations are now unblocked");
        assert!(!gate.is_blocked());
    }

    #[tokio::test]
    async fn unknown_job_ids_yield_404() {
        let app = router(test_state(MockEngine::default()));

        let (status, body) =
            request(&app, "GET", &format!("/job_status/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "not_found");

        let (status, _) = request(&app, "GET", "/job_status/not-a-uuid").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
