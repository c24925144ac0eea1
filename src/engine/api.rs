use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{
    error::JudgeError,
    models::{Priority, RunReport, RunRequest, SubmitRequest, SubmitResponse, VerdictReport},
    monitor::{MonitorReport, ResourceMonitor},
    sandbox::LanguageProfile,
    security::SecurityStatus,
    service::{JudgingService, QueueOverview},
};

#[derive(Clone)]
pub struct AppState {
    service: Arc<JudgingService>,
    monitor: Arc<ResourceMonitor>,
}

#[derive(Debug, Default, Deserialize)]
struct PingRequest {
    #[serde(default)]
    priority: Priority,
}

#[derive(Debug, Serialize)]
struct PingResponse {
    nonce: Uuid,
    queue: &'static str,
}

#[derive(Debug, Serialize)]
struct LanguageEntry {
    id: String,
    #[serde(flatten)]
    profile: LanguageProfile,
}

pub fn routes(service: Arc<JudgingService>, monitor: Arc<ResourceMonitor>) -> Router {
    let state = AppState { service, monitor };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/submissions", post(submit))
        .route("/v1/submissions/{id}", get(verdict))
        .route("/v1/runs", post(run))
        .route("/v1/languages", get(languages))
        .route("/v1/ops/ping", post(ping))
        .route("/v1/ops/queues", get(queues))
        .route("/v1/ops/monitor", get(monitor_report))
        .route("/v1/ops/security", get(security))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.service.metrics().render_prometheus())
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), JudgeError> {
    let response = state.service.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn verdict(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VerdictReport>, JudgeError> {
    Ok(Json(state.service.report(id).await?))
}

async fn run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunReport>, JudgeError> {
    Ok(Json(state.service.run_single(request).await?))
}

async fn languages(State(state): State<AppState>) -> Json<Vec<LanguageEntry>> {
    Json(
        state
            .service
            .languages()
            .profiles()
            .iter()
            .map(|(id, profile)| LanguageEntry {
                id: id.clone(),
                profile: profile.clone(),
            })
            .collect(),
    )
}

async fn ping(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<PingResponse>), JudgeError> {
    let request: PingRequest = if body.is_empty() {
        PingRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| JudgeError::InvalidRequest(e.to_string()))?
    };
    let nonce = state.service.ping(request.priority).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PingResponse {
            nonce,
            queue: request.priority.queue_name(),
        }),
    ))
}

async fn queues(State(state): State<AppState>) -> Result<Json<QueueOverview>, JudgeError> {
    Ok(Json(state.service.queue_overview().await?))
}

async fn monitor_report(State(state): State<AppState>) -> Json<MonitorReport> {
    Json(state.monitor.report().await)
}

async fn security(State(state): State<AppState>) -> Json<SecurityStatus> {
    Json(state.service.security_status())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::engine::service::tests::{harness, judge_config};

    fn app() -> (Router, crate::engine::service::tests::Harness) {
        let harness = harness();
        let config = judge_config(harness.sandbox_root.path().to_path_buf());
        let monitor = Arc::new(ResourceMonitor::new(&config.monitor));
        (routes(harness.service.clone(), monitor), harness)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn submit_then_read_pending_verdict() {
        let (app, _harness) = app();
        let (status, body) = call(
            &app,
            post_json(
                "/v1/submissions",
                serde_json::json!({
                    "user_id": 1,
                    "problem_id": 1,
                    "language": "sh",
                    "source_code": "read x; echo $((x * 2))",
                    "time_limit_ms": 1000,
                    "memory_limit_mb": 64,
                    "priority": "critical"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        let id = body["submission_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, get(&format!("/v1/submissions/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verdict"], "PE");
        assert_eq!(body["test_cases_run"], 0);

        let (_, queues) = call(&app, get("/v1/ops/queues")).await;
        assert_eq!(queues["depths"]["critical"], 1);
    }

    #[tokio::test]
    async fn unsupported_language_is_a_bad_request() {
        let (app, _harness) = app();
        let (status, body) = call(
            &app,
            post_json(
                "/v1/submissions",
                serde_json::json!({
                    "user_id": 1,
                    "problem_id": 1,
                    "language": "cobol",
                    "source_code": "DISPLAY 'HI'.",
                    "time_limit_ms": 1000,
                    "memory_limit_mb": 64
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported_language");
    }

    #[tokio::test]
    async fn single_run_returns_program_output() {
        let (app, _harness) = app();
        let (status, body) = call(
            &app,
            post_json(
                "/v1/runs",
                serde_json::json!({
                    "language": "sh",
                    "source_code": "read x; echo \"hello $x\"",
                    "input": "judge\n",
                    "time_limit_ms": 1000,
                    "memory_limit_mb": 64
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stdout"], "hello judge\n");
        assert_eq!(body["exit_code"], 0);
        assert!(body.get("verdict").is_none());

        let (status, body) = call(
            &app,
            post_json(
                "/v1/runs",
                serde_json::json!({
                    "language": "sh",
                    "source_code": "if then fi (",
                    "time_limit_ms": 1000,
                    "memory_limit_mb": 64
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verdict"], "CE");
    }

    #[tokio::test]
    async fn unknown_submission_is_not_found() {
        let (app, _harness) = app();
        let (status, _) = call(&app, get(&format!("/v1/submissions/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn operational_endpoints_are_read_only_views() {
        let (app, _harness) = app();

        let (status, body) = call(&app, post_json("/v1/ops/ping", serde_json::json!({ "priority": "low" }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["queue"], "low");

        let (_, body) = call(&app, get("/v1/ops/security")).await;
        assert_eq!(body["cgroups"], false);
        assert_eq!(body["active_sessions"], 0);

        let (_, body) = call(&app, get("/v1/ops/monitor")).await;
        assert_eq!(body["running"], false);
        assert!(body["violations"].as_array().unwrap().is_empty());

        let (_, body) = call(&app, get("/v1/languages")).await;
        assert_eq!(body[0]["id"], "sh");
        assert_eq!(body[0]["extension"], "sh");

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
