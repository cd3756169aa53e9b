// tailproxyd control API
// JSON over HTTP/1.1 on the unix socket, thin wrappers over the Supervisor

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tailproxy_common::{CommandRequest, CommandResponse, LogLevelRequest, RunConfiguration};

use crate::config::DaemonConfig;
use crate::supervisor::Supervisor;

/// Shared application state
pub struct AppState {
    pub supervisor: Supervisor,
    pub config: DaemonConfig,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn success_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(SuccessResponse {
            message: message.into(),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/command", post(command))
        .route("/api/logs", get(logs).delete(clear_logs))
        .route("/api/log-level", put(set_log_level))
        .route("/api/peers", get(peers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.status())
}

/// Start a run from the request body, or from the configured profile when empty
async fn start(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let run = if body.iter().all(u8::is_ascii_whitespace) {
        state.config.run.clone()
    } else {
        match serde_json::from_slice::<RunConfiguration>(&body) {
            Ok(run) => run,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid run configuration: {}", e),
                )
            }
        }
    };

    if let Err(e) = run.validate() {
        warn!("API: Rejected start request: {}", e);
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }
    if let Err(e) = state.config.check_run(&run) {
        warn!("API: Rejected start request: {}", e);
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    info!("API: Start request");
    state.supervisor.start(run);
    success_response(StatusCode::ACCEPTED, "tailscaled starting")
}

async fn stop(State(state): State<Arc<AppState>>) -> Response {
    info!("API: Stop request");
    state.supervisor.stop();
    success_response(StatusCode::OK, "tailscaled stopped")
}

async fn command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    info!("API: Command request");
    let output = state.supervisor.run_command(&request.command).await;
    Json(CommandResponse { output })
}

async fn logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.supervisor.logs(),
    )
}

async fn clear_logs(State(state): State<Arc<AppState>>) -> Response {
    state.supervisor.clear_logs();
    success_response(StatusCode::OK, "logs cleared")
}

// Parsed by hand so an out-of-range level is a 400 rather than a 422
async fn set_log_level(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match serde_json::from_slice::<LogLevelRequest>(&body) {
        Ok(request) => {
            state.supervisor.set_log_level(request.level);
            success_response(StatusCode::OK, format!("log level set to {}", request.level))
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, format!("Invalid log level: {}", e)),
    }
}

async fn peers(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.tailnet_status().await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => error_response(StatusCode::CONFLICT, "tailscaled is not running"),
        Err(e) => {
            error!("Failed to query tailnet status: {:#}", e);
            error_response(StatusCode::BAD_GATEWAY, format!("{:#}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use tailproxy_common::{DaemonStatus, LogLevel};

    use crate::control::NOT_RUNNING_MESSAGE;
    use crate::logbuf::LogBuffer;

    fn app() -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState {
            supervisor: Supervisor::new(LogBuffer::new()),
            config: DaemonConfig::default(),
        });
        (create_router(state.clone()), state)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app();
        let (status, body) = send(router, empty_request("GET", "/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_status_when_idle() {
        let (router, _) = app();
        let (status, body) = send(router, empty_request("GET", "/api/status")).await;
        assert_eq!(status, StatusCode::OK);

        let parsed: DaemonStatus = serde_json::from_slice(&body).unwrap();
        assert!(!parsed.running);
        assert!(!parsed.ssh_listening);
        assert_eq!(parsed.log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn test_command_while_idle() {
        let (router, _) = app();
        let (status, body) = send(
            router,
            json_request("POST", "/api/command", r#"{"command":"status"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let parsed: CommandResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.output, NOT_RUNNING_MESSAGE);
    }

    #[tokio::test]
    async fn test_log_level_validation() {
        let (router, state) = app();
        let (status, _) = send(
            router.clone(),
            json_request("PUT", "/api/log-level", r#"{"level":0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.supervisor.log_level(), LogLevel::Debug);

        let (status, _) = send(router, json_request("PUT", "/api/log-level", r#"{"level":5}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.supervisor.log_level(), LogLevel::Debug);
    }

    #[tokio::test]
    async fn test_logs_snapshot_and_clear() {
        let (router, state) = app();
        state.supervisor.clear_logs();
        let (_, body) = send(router.clone(), empty_request("GET", "/api/logs")).await;
        assert!(body.is_empty());

        let (status, _) = send(router, empty_request("DELETE", "/api/logs")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.supervisor.logs().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_incomplete_profile() {
        // the default profile has no paths
        let (router, state) = app();
        let (status, _) = send(router.clone(), empty_request("POST", "/api/start")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(router, json_request("POST", "/api/start", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!state.supervisor.is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_remote_ssh() {
        let (router, _) = app();
        let body = r#"{
            "ssh_listen": "0.0.0.0:1056",
            "executable_path": "/opt/ts/libtailscaled.so",
            "socket_path": "/tmp/tp/ts.sock",
            "state_path": "/tmp/tp/state"
        }"#;
        let (status, body) = send(router, json_request("POST", "/api/start", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("Security violation"));
    }

    #[tokio::test]
    async fn test_stop_and_peers_while_idle() {
        let (router, _) = app();
        let (status, _) = send(router.clone(), empty_request("POST", "/api/stop")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(router, empty_request("GET", "/api/peers")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
