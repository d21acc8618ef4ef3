//! Smart HTTP listener.
//!
//! Routes:
//! - `GET  /healthz`                   - Health check
//! - `GET  /{repo}/info/refs`          - Ref advertisement (upload-pack only)
//! - `POST /{repo}/git-upload-pack`    - Stateless-RPC fetch
//! - `POST /{repo}/git-receive-pack`   - Always rejected (403)
//!
//! Requests are anonymous; a repository must resolve to read access without
//! an identity to be served.

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{normalize_repo_name, Backend, Repository};
use crate::git::{GitInvocation, GitService};
use crate::lifecycle::{bind, Listener, ListenerControl, ListenerError, ListenerKind};
use crate::pktline;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/{repo}/info/refs", get(handle_info_refs))
        .route("/{repo}/git-upload-pack", post(handle_upload_pack))
        .route("/{repo}/git-receive-pack", post(handle_receive_pack))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{repo}/info/refs?service=git-upload-pack`
#[instrument(skip(state, headers), fields(%repo))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let service = query.service.unwrap_or_default();
    match GitService::from_name(&service) {
        Some(GitService::UploadPack) => {}
        Some(GitService::ReceivePack) => return Ok(push_rejected()),
        _ => {
            return Ok((
                StatusCode::BAD_REQUEST,
                format!("Unsupported service: {service}"),
            )
                .into_response())
        }
    }

    let repository = authorize(&state, &repo).await?;
    let protocol = git_protocol(&headers);
    let output = GitInvocation {
        service: GitService::UploadPack,
        repo: repository.name(),
        repo_path: repository.path(),
        identity: None,
        config_path: &state.config_path,
        protocol: protocol.as_deref(),
        stateless_rpc: true,
        advertise_refs: true,
    }
    .command()
    .output()
    .await
    .context("failed to run git upload-pack --advertise-refs")?;
    if !output.status.success() {
        return Err(AppError::Internal(anyhow::anyhow!(
            "git upload-pack --advertise-refs exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    // Protocol v2 responses carry no service announcement.
    let mut body = Vec::new();
    if !protocol.as_deref().is_some_and(|p| p.contains("version=2")) {
        body.extend(pktline::encode(b"# service=git-upload-pack\n")?);
        body.extend_from_slice(pktline::FLUSH);
    }
    body.extend(output.stdout);

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// `POST /{repo}/git-upload-pack`
#[instrument(skip(state, headers, body), fields(%repo))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let repository = authorize(&state, &repo).await?;
    let protocol = git_protocol(&headers);

    let mut child = GitInvocation {
        service: GitService::UploadPack,
        repo: repository.name(),
        repo_path: repository.path(),
        identity: None,
        config_path: &state.config_path,
        protocol: protocol.as_deref(),
        stateless_rpc: true,
        advertise_refs: false,
    }
    .command()
    .spawn()
    .context("failed to spawn git upload-pack")?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&body).await {
                debug!(error = %e, "failed to write upload-pack request body");
            }
            // Dropping stdin signals EOF.
        });
    }

    let stdout = child
        .stdout
        .take()
        .context("failed to capture git upload-pack stdout")?;
    let body = Body::from_stream(ReaderStream::new(stdout));

    // Reap the child in the background so we don't leak processes.
    tokio::spawn(async move {
        match child.wait_with_output().await {
            Ok(out) if !out.status.success() => {
                warn!(
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "git upload-pack exited with non-zero status"
                );
            }
            Err(e) => error!(error = %e, "failed to wait on git upload-pack"),
            _ => {}
        }
    });

    info!(repo = %repository.name(), "serving upload-pack");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// `POST /{repo}/git-receive-pack`
///
/// HTTP is anonymous; pushes go over SSH.
#[instrument(skip(state))]
async fn handle_receive_pack(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> Response {
    warn!(%repo, "rejected git-receive-pack over HTTP");
    state
        .metrics
        .metrics
        .git_request(ListenerKind::Http, GitService::ReceivePack);
    push_rejected()
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn push_rejected() -> Response {
    (
        StatusCode::FORBIDDEN,
        "Push (git-receive-pack) is not supported over HTTP; push over SSH instead.\n",
    )
        .into_response()
}

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Resolve anonymous read access, then look the repository up.
async fn authorize(state: &AppState, raw: &str) -> Result<Repository, AppError> {
    let metrics = &state.metrics.metrics;
    let repo = normalize_repo_name(raw);
    metrics.git_request(ListenerKind::Http, GitService::UploadPack);
    if !state.access.resolve(repo, None).can_read() {
        metrics.denied(ListenerKind::Http);
        return Err(AppError::Forbidden(format!("access denied to repository {repo}")));
    }
    state
        .backend
        .repository(repo)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("repository {repo} not found")))
}

/// Serve `router` on `addr` until `control` asks it to stop.  In-flight
/// requests are dropped once the shutdown deadline forces the listener.
pub(crate) async fn serve_router(
    kind: ListenerKind,
    addr: &str,
    router: Router,
    control: &ListenerControl,
) -> Result<(), ListenerError> {
    let listener: TcpListener = bind(kind, addr).await?;
    let Some(_running) = control.begin() else {
        return Ok(());
    };

    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(control.graceful().clone().cancelled_owned())
        .into_future();
    tokio::select! {
        result = serve => result.map_err(|e| ListenerError::Serve {
            kind,
            source: anyhow::Error::new(e),
        }),
        () = control.force().cancelled() => {
            debug!(listener = %kind, "in-flight requests force-closed");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub struct HttpListener {
    state: Arc<AppState>,
    control: ListenerControl,
}

impl HttpListener {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            control: ListenerControl::new(),
        }
    }
}

#[async_trait::async_trait]
impl Listener for HttpListener {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Http
    }

    fn control(&self) -> &ListenerControl {
        &self.control
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let router = create_router(Arc::clone(&self.state));
        serve_router(
            ListenerKind::Http,
            &self.state.config.http.listen_addr,
            router,
            &self.control,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The repository does not allow anonymous reads.
    Forbidden(String),
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
