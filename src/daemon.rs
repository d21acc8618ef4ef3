//! Raw `git://` listener.
//!
//! Read-only and anonymous: only `git-upload-pack` is served, to callers
//! that resolve to at least read access without an identity.  The request
//! packet must arrive within the configured idle timeout, and concurrent
//! connections are capped.  Every refusal is sent as an `ERR` packet-line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::git::{parse_exec_command, GitInvocation, GitService};
use crate::lifecycle::{bind, Listener, ListenerControl, ListenerError, ListenerKind};
use crate::pktline;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonRequest {
    pub service: GitService,
    pub repo: String,
    pub host: Option<String>,
    /// Extra parameters (e.g. `version=2`), joined for `GIT_PROTOCOL`.
    pub protocol: Option<String>,
}

/// Parse `git-upload-pack /repo.git\0host=example.com\0\0version=2\0`.
pub fn parse_request(data: &[u8]) -> Result<DaemonRequest> {
    let text = std::str::from_utf8(data).context("request is not UTF-8")?;
    let mut fields = text.split('\0');
    let command = fields.next().unwrap_or_default().trim_end_matches('\n');
    let (service, repo) =
        parse_exec_command(command).ok_or_else(|| anyhow!("malformed request: {command:?}"))?;

    let mut host = None;
    let mut extra = Vec::new();
    for field in fields.filter(|f| !f.is_empty()) {
        match field.strip_prefix("host=") {
            Some(h) => host = Some(h.to_string()),
            None => extra.push(field),
        }
    }
    Ok(DaemonRequest {
        service,
        repo,
        host,
        protocol: (!extra.is_empty()).then(|| extra.join(":")),
    })
}

async fn send_error<W: AsyncWrite + Unpin>(stream: &mut W, message: &str) -> Result<()> {
    stream
        .write_all(&pktline::error_line(message))
        .await
        .context("failed to send ERR packet")?;
    stream.shutdown().await.ok();
    Ok(())
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
async fn handle_connection<S>(state: Arc<AppState>, mut stream: S, idle_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = match tokio::time::timeout(idle_timeout, pktline::read_data(&mut stream)).await {
        Ok(Ok(data)) => parse_request(&data),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("timed out waiting for request")),
    };
    let request = match request {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %format!("{e:#}"), "bad git daemon request");
            return send_error(&mut stream, &format!("{e}")).await;
        }
    };

    let metrics = &state.metrics.metrics;
    metrics.git_request(ListenerKind::Git, request.service);
    if request.service != GitService::UploadPack {
        return send_error(&mut stream, "service not enabled").await;
    }
    if !state.access.resolve(&request.repo, None).can_read() {
        warn!(repo = %request.repo, "git daemon access denied");
        metrics.denied(ListenerKind::Git);
        return send_error(&mut stream, "unauthorized").await;
    }
    let Some(repo) = state.backend.repository(&request.repo).await? else {
        return send_error(&mut stream, "repository not found").await;
    };

    let mut child = GitInvocation {
        service: request.service,
        repo: repo.name(),
        repo_path: repo.path(),
        identity: None,
        config_path: &state.config_path,
        protocol: request.protocol.as_deref(),
        stateless_rpc: false,
        advertise_refs: false,
    }
    .command()
    .spawn()
    .context("failed to spawn git upload-pack")?;
    info!(repo = %repo.name(), host = ?request.host, "serving git daemon request");

    let mut stdin = child.stdin.take().context("git stdin was not piped")?;
    let mut stdout = child.stdout.take().context("git stdout was not piped")?;
    let mut stderr = child.stderr.take().context("git stderr was not piped")?;

    let (mut rd, mut wr) = tokio::io::split(stream);
    let upload = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut rd, &mut stdin).await;
    });
    let diagnostics = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let copied = tokio::io::copy(&mut stdout, &mut wr).await;
    wr.shutdown().await.ok();
    upload.abort();

    let status = child.wait().await.context("failed to wait on git upload-pack")?;
    let diagnostics = diagnostics.await.unwrap_or_default();
    if !status.success() {
        warn!(%status, stderr = %diagnostics.trim(), "git upload-pack exited with non-zero status");
    }
    debug!(bytes = copied.unwrap_or_default(), "git daemon request finished");
    Ok(())
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub struct GitDaemonListener {
    state: Arc<AppState>,
    connections: Arc<Semaphore>,
    control: ListenerControl,
}

impl GitDaemonListener {
    pub fn new(state: Arc<AppState>) -> Self {
        let connections = Arc::new(Semaphore::new(state.config.git.max_connections));
        Self {
            state,
            connections,
            control: ListenerControl::new(),
        }
    }
}

#[async_trait::async_trait]
impl Listener for GitDaemonListener {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Git
    }

    fn control(&self) -> &ListenerControl {
        &self.control
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let listener = bind(ListenerKind::Git, &self.state.config.git.listen_addr).await?;
        let Some(_running) = self.control.begin() else {
            return Ok(());
        };
        let idle_timeout = Duration::from_secs(self.state.config.git.idle_timeout);

        loop {
            let (mut stream, peer_addr) = tokio::select! {
                () = self.control.graceful().cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "git daemon accept failed");
                        continue;
                    }
                },
            };

            let Ok(permit) = Arc::clone(&self.connections).try_acquire_owned() else {
                warn!(peer = %peer_addr, "git daemon connection limit reached");
                self.control.spawn(async move {
                    let _ = send_error(&mut stream, "too many connections").await;
                });
                continue;
            };

            let state = Arc::clone(&self.state);
            let connection = self.state.metrics.metrics.connection(ListenerKind::Git);
            self.control.spawn(async move {
                let _permit = permit;
                let _connection = connection;
                if let Err(e) = handle_connection(state, stream, idle_timeout).await {
                    warn!(peer = %peer_addr, error = %format!("{e:#}"), "git daemon connection failed");
                }
            });
        }

        debug!("git daemon stopped accepting");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Visibility;

    #[test]
    fn parses_request_with_host_and_protocol() {
        let req = parse_request(b"git-upload-pack /widgets.git\0host=example.com:9418\0\0version=2\0").unwrap();
        assert_eq!(
            req,
            DaemonRequest {
                service: GitService::UploadPack,
                repo: "widgets".into(),
                host: Some("example.com:9418".into()),
                protocol: Some("version=2".into()),
            }
        );
    }

    #[test]
    fn parses_bare_request() {
        let req = parse_request(b"git-upload-pack /widgets\n").unwrap();
        assert_eq!(req.repo, "widgets");
        assert_eq!(req.host, None);
        assert_eq!(req.protocol, None);
        assert!(parse_request(b"rm -rf /\0").is_err());
    }

    async fn exchange(state: Arc<AppState>, request: &[u8], idle: Duration) -> String {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(state, server, idle));
        client.write_all(request).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        task.await.unwrap().unwrap();
        String::from_utf8(reply).unwrap()
    }

    fn request(line: &str) -> Vec<u8> {
        pktline::encode(line.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn push_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::for_test(tmp.path());
        let reply = exchange(state, &request("git-receive-pack /widgets.git\0"), Duration::from_secs(5)).await;
        assert!(reply.ends_with("ERR service not enabled\n"), "{reply}");
    }

    #[tokio::test]
    async fn missing_repo_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::for_test(tmp.path());
        let reply = exchange(state, &request("git-upload-pack /widgets.git\0"), Duration::from_secs(5)).await;
        assert!(reply.ends_with("ERR repository not found\n"), "{reply}");
    }

    #[tokio::test]
    async fn private_repo_is_unauthorized() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::for_test(tmp.path());
        state.access.set_visibility("widgets", Visibility::Private).unwrap();
        let reply = exchange(state, &request("git-upload-pack /widgets.git\0"), Duration::from_secs(5)).await;
        assert!(reply.ends_with("ERR unauthorized\n"), "{reply}");
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::for_test(tmp.path());
        let reply = exchange(state, b"", Duration::from_millis(50)).await;
        assert!(reply.contains("ERR timed out"), "{reply}");
    }
}
