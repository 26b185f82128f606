//! HTTP API for `berthd serve`.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/environments/{env}/rollout` | Roll out the configured stack |
//! | GET | `/api/v1/environments/{env}/rollout` | Current or last rollout report |
//! | POST | `/api/v1/environments/{env}/rollout/cancel` | Cancel the in-flight rollout |
//! | POST | `/api/v1/certificates/pass` | Run a certificate pass now |
//! | GET | `/api/v1/certificates` | Certificate records |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

use berth_core::EnvironmentName;
use berth_rollout::RolloutError;

use crate::daemon::{Daemon, DeployError};

#[derive(Clone)]
pub struct ApiState {
    pub daemon: Arc<Daemon>,
}

pub fn build_router(daemon: Arc<Daemon>) -> Router {
    let api_routes = Router::new()
        .route(
            "/environments/{env}/rollout",
            get(get_rollout).post(start_rollout),
        )
        .route("/environments/{env}/rollout/cancel", post(cancel_rollout))
        .route("/certificates", get(list_certificates))
        .route("/certificates/pass", post(run_certificate_pass))
        .with_state(ApiState { daemon });

    Router::new().nest("/api/v1", api_routes)
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.into()),
        }),
    )
        .into_response()
}

fn parse_env(raw: &str) -> Result<EnvironmentName, Response> {
    raw.parse()
        .map_err(|_| api_error(StatusCode::NOT_FOUND, format!("unknown environment '{raw}'")))
}

fn rollout_error_status(e: &RolloutError) -> StatusCode {
    match e {
        RolloutError::InProgress(_) => StatusCode::CONFLICT,
        RolloutError::Precondition { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RolloutError::InvalidGraph(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RolloutError::NoHistory(_) => StatusCode::NOT_FOUND,
        RolloutError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// POST /api/v1/environments/{env}/rollout
///
/// Runs the rollout to completion and answers with its report.
async fn start_rollout(State(state): State<ApiState>, Path(env): Path<String>) -> Response {
    let env = match parse_env(&env) {
        Ok(env) => env,
        Err(resp) => return resp,
    };
    match state.daemon.deploy(env).await {
        Ok(deployment) => {
            if let Err(e) = &deployment.published {
                warn!(environment = %env, error = %e, "rollout finished but proxy not updated");
            }
            ok(StatusCode::ACCEPTED, deployment.view())
        }
        Err(DeployError::NotDeployable(_)) => api_error(
            StatusCode::NOT_FOUND,
            format!("environment {env} is not declared or not enabled"),
        ),
        Err(DeployError::Compose(e)) => api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        Err(DeployError::Rollout(e)) => api_error(rollout_error_status(&e), e.to_string()),
    }
}

/// GET /api/v1/environments/{env}/rollout
async fn get_rollout(State(state): State<ApiState>, Path(env): Path<String>) -> Response {
    let env = match parse_env(&env) {
        Ok(env) => env,
        Err(resp) => return resp,
    };
    match state.daemon.status(env) {
        Ok(Some(report)) => ok(StatusCode::OK, report),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("no rollout of {env} recorded")),
        Err(e) => api_error(rollout_error_status(&e), e.to_string()),
    }
}

/// POST /api/v1/environments/{env}/rollout/cancel
async fn cancel_rollout(State(state): State<ApiState>, Path(env): Path<String>) -> Response {
    let env = match parse_env(&env) {
        Ok(env) => env,
        Err(resp) => return resp,
    };
    if state.daemon.cancel(env) {
        ok(StatusCode::ACCEPTED, format!("cancellation of {env} requested"))
    } else {
        api_error(StatusCode::CONFLICT, format!("no rollout of {env} in progress"))
    }
}

/// POST /api/v1/certificates/pass
async fn run_certificate_pass(State(state): State<ApiState>) -> Response {
    match state.daemon.certificate_pass().await {
        Ok(report) => ok(StatusCode::OK, report),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /api/v1/certificates
async fn list_certificates(State(state): State<ApiState>) -> Response {
    match state.daemon.certificates() {
        Ok(records) => ok(StatusCode::OK, records),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use berth_certs::{CertificateAuthority, IssuedCertificate, RenewalError};
    use berth_core::{RawConfig, resolve};
    use berth_proxy::MemorySink;
    use berth_rollout::{MemoryControlPlane, RolloutConfig};
    use berth_state::StateStore;

    use crate::daemon::DaemonConfig;

    const TOML: &str = r#"
[project]
name = "shop"

[environments.production]
domain = "app.example.com"
port = 8001
[environments.production.images]
app = "shop:v1"
[environments.production.services.web]
replicas = 2

[environments.staging]
enabled = false
domain = "staging.example.com"
port = 8002
[environments.staging.images]
app = "shop:v2"
"#;

    struct StaticAuthority;

    #[async_trait]
    impl CertificateAuthority for StaticAuthority {
        async fn issue(&self, domain: &str) -> Result<IssuedCertificate, RenewalError> {
            Ok(IssuedCertificate {
                cert_path: PathBuf::from(format!("/live/{domain}/fullchain.pem")),
                key_path: PathBuf::from(format!("/live/{domain}/privkey.pem")),
                expires_at: u64::MAX / 2,
            })
        }

        async fn renew(&self, domain: &str) -> Result<IssuedCertificate, RenewalError> {
            self.issue(domain).await
        }
    }

    struct Harness {
        control_plane: Arc<MemoryControlPlane>,
        sink: Arc<MemorySink>,
        router: Router,
    }

    fn harness(startup_probes: u32) -> Harness {
        let topology = resolve(&RawConfig::from_toml_str(TOML).unwrap()).unwrap();
        let control_plane = Arc::new(MemoryControlPlane::with_startup_probes(startup_probes));
        let sink = Arc::new(MemorySink::new());
        let config = DaemonConfig {
            rollout: RolloutConfig {
                health_timeout_secs: 5,
                poll_interval_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let daemon = Daemon::new(
            topology,
            control_plane.clone(),
            sink.clone(),
            Arc::new(StaticAuthority),
            StateStore::open_in_memory().unwrap(),
            config,
        );
        Harness {
            control_plane,
            sink,
            router: build_router(Arc::new(daemon)),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn rollout_converges_and_publishes_backends() {
        let h = harness(1);
        let (status, body) = send(&h.router, "POST", "/api/v1/environments/production/rollout").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["outcome"], "success");
        assert_eq!(body["data"]["backends"], 2);

        let site = h.sink.active_site().unwrap();
        assert!(site.contains("upstream berth_production {"));
        assert!(site.contains("server 127.0.0.1:3200"));

        let (status, body) = send(&h.router, "GET", "/api/v1/environments/production/rollout").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["environment"], "production");
    }

    #[tokio::test]
    async fn status_before_any_rollout_is_not_found() {
        let h = harness(1);
        let (status, body) = send(&h.router, "GET", "/api/v1/environments/production/rollout").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn unknown_or_disabled_environment_is_not_found() {
        let h = harness(1);
        let (status, _) = send(&h.router, "POST", "/api/v1/environments/qa/rollout").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&h.router, "POST", "/api/v1/environments/staging/rollout").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_unavailable() {
        let h = harness(1);
        h.control_plane.set_unreachable(true);
        let (status, body) = send(&h.router, "POST", "/api/v1/environments/production/rollout").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("production"));
        assert!(h.control_plane.events().is_empty());
    }

    #[tokio::test]
    async fn concurrent_rollout_conflicts_and_can_be_cancelled() {
        let h = harness(30);
        let first = {
            let router = h.router.clone();
            tokio::spawn(async move {
                send(&router, "POST", "/api/v1/environments/production/rollout").await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (status, body) = send(&h.router, "POST", "/api/v1/environments/production/rollout").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("in progress"));

        let (status, _) = send(&h.router, "POST", "/api/v1/environments/production/rollout/cancel").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = first.await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["outcome"], "partial");

        let (status, _) = send(&h.router, "POST", "/api/v1/environments/production/rollout/cancel").await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn certificate_pass_issues_and_lists_records() {
        let h = harness(1);
        let (status, body) = send(&h.router, "POST", "/api/v1/certificates/pass").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["issued"], serde_json::json!(["app.example.com"]));
        assert_eq!(body["data"]["reloaded"], true);

        let (status, body) = send(&h.router, "GET", "/api/v1/certificates").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["domain"], "app.example.com");
        assert!(h.sink.active_site().unwrap().contains("listen 443 ssl;"));
    }
}
