use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::process::Command;

use crate::access::AclSnapshot;
use crate::backend::Backend;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub git: CheckResult,
    pub repos: CheckResult,
    pub acl: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// Every transport shells out to `git`.
async fn check_git() -> CheckResult {
    match Command::new("git").arg("--version").output().await {
        Ok(out) if out.status.success() => {
            CheckResult::healthy(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(out) => CheckResult::unhealthy(format!("git --version exited with {}", out.status)),
        Err(e) => CheckResult::unhealthy(format!("failed to run git: {e}")),
    }
}

async fn check_repos(backend: &dyn Backend) -> CheckResult {
    match backend.repositories().await {
        Ok(repos) => CheckResult::healthy(format!("{} repositories", repos.len())),
        Err(e) => CheckResult::unhealthy(format!("{e:#}")),
    }
}

/// The on-disk ACL is what hook processes read.
async fn check_acl(state: &AppState) -> CheckResult {
    let path = state.config.acl_path();
    match tokio::task::spawn_blocking(move || AclSnapshot::load(&path)).await {
        Ok(Ok(acl)) => CheckResult::healthy(format!("{} repositories with ACL entries", acl.repos.len())),
        Ok(Err(e)) => CheckResult::unhealthy(format!("{e:#}")),
        Err(e) => CheckResult::unhealthy(format!("ACL check task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.git.ok && checks.repos.ok && checks.acl.ok;
    let any_critical = !checks.git.ok || !checks.repos.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (git, repos, acl) = tokio::join!(
        check_git(),
        check_repos(state.backend.as_ref()),
        check_acl(&state),
    );

    let checks = HealthChecks { git, repos, acl };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
