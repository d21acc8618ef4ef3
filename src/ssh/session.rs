//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Any public key is accepted at authentication time; the key's fingerprint
//! becomes the session [`Identity`] and authorization happens per request,
//! against the repository being accessed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::access::{AccessLevel, Identity};
use crate::backend::{Backend, Repository};
use crate::commands::{command_name, CommandError};
use crate::git::{parse_exec_command, GitInvocation, GitService};
use crate::lifecycle::ListenerKind;
use crate::metrics::{CommandLabels, CommandOutcome, Metrics};
use crate::AppState;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    identity: Option<Identity>,
    /// Stdin of the running git child; client data is forwarded here.
    child_stdin: Option<tokio::process::ChildStdin>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
}

impl SshSession {
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            identity: None,
            child_stdin: None,
            git_protocol: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel helpers
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// RFC 4254.  Git clients treat a close without exit-status as a transport
/// failure.
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

/// Report `message` on stderr (extended data type 1) and fail the channel.
fn reject(session: &mut Session, channel_id: ChannelId, message: &str) {
    session.extended_data(channel_id, 1, CryptoVec::from_slice(message.as_bytes()));
    finish_channel(session, channel_id, 1);
}

/// Copy `reader` onto the channel until EOF or until the client goes away.
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    handle: &Handle,
    channel_id: ChannelId,
    extended: Option<u32>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = CryptoVec::from_slice(&buf[..n]);
                let sent = match extended {
                    Some(ext) => handle.extended_data(channel_id, ext, data).await,
                    None => handle.data(channel_id, data).await,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "error reading git output");
                break;
            }
        }
    }
}

fn outcome_of(result: &Result<(), CommandError>) -> CommandOutcome {
    match result {
        Ok(()) => CommandOutcome::Ok,
        Err(CommandError::Unauthorized { .. }) => CommandOutcome::Unauthorized,
        Err(CommandError::RepositoryNotFound(_)) => CommandOutcome::NotFound,
        Err(_) => CommandOutcome::Error,
    }
}

fn record_command(metrics: &Metrics, line: &str, result: &Result<(), CommandError>) {
    metrics
        .session_commands
        .get_or_create(&CommandLabels {
            command: command_name(line).to_string(),
            outcome: outcome_of(result),
        })
        .inc();
}

// ---------------------------------------------------------------------------
// Git transport authorization
// ---------------------------------------------------------------------------

/// What to do with a git transport request.
#[derive(Debug, PartialEq, Eq)]
enum GitPlan {
    Deny(AccessLevel),
    NotFound,
    /// Push to a repository that does not exist yet.
    Create,
    Serve(Repository),
}

/// Access is checked before the repository is looked up, so a denied caller
/// learns nothing about which repositories exist.
async fn plan_git(
    state: &AppState,
    service: GitService,
    repo: &str,
    identity: Option<&Identity>,
) -> Result<GitPlan> {
    let level = state.access.resolve(repo, identity);
    if level < service.required_access() {
        return Ok(GitPlan::Deny(level));
    }
    Ok(match state.backend.repository(repo).await? {
        Some(repository) => GitPlan::Serve(repository),
        None if service == GitService::ReceivePack => GitPlan::Create,
        None => GitPlan::NotFound,
    })
}

/// Initialise `repo` and install its hooks before the first push lands.
async fn create_repository(state: &AppState, repo: &str) -> Result<Repository> {
    let created = state.backend.create(repo).await?;
    let provisioner = state.provisioner.clone();
    let repo_dir = created.path().to_path_buf();
    tokio::task::spawn_blocking(move || provisioner.provision_repo(&repo_dir))
        .await
        .context("hook provisioning task failed")??;
    state.metrics.metrics.repos_created.inc();
    info!(%repo, "created repository on first push");
    Ok(created)
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

impl SshSession {
    /// Run a session command and report its outcome as the exit status.
    async fn run_command(&mut self, channel_id: ChannelId, line: &str, session: &mut Session) {
        let mut out = String::new();
        let result = self
            .state
            .router
            .dispatch(line, self.identity.as_ref(), &mut out)
            .await;

        let metrics = &self.state.metrics.metrics;
        record_command(metrics, line, &result);

        if !out.is_empty() {
            session.data(channel_id, CryptoVec::from_slice(out.as_bytes()));
        }
        match result {
            Ok(()) => finish_channel(session, channel_id, 0),
            Err(e) => {
                if matches!(e, CommandError::Unauthorized { .. }) {
                    metrics.denied(ListenerKind::Ssh);
                }
                if let CommandError::Internal(ref err) = e {
                    error!(command = %line, error = %format!("{err:#}"), "session command failed");
                }
                let mut message = e.to_string();
                if !message.ends_with('\n') {
                    message.push('\n');
                }
                session.extended_data(channel_id, 1, CryptoVec::from_slice(message.as_bytes()));
                finish_channel(session, channel_id, e.exit_status());
            }
        }
    }

    /// Authorize a git transport request and connect a git child process to
    /// the channel.
    async fn run_git(
        &mut self,
        channel_id: ChannelId,
        service: GitService,
        repo: String,
        session: &mut Session,
    ) -> Result<()> {
        let metrics = &self.state.metrics.metrics;
        metrics.git_request(ListenerKind::Ssh, service);

        let repository = match plan_git(&self.state, service, &repo, self.identity.as_ref()).await? {
            GitPlan::Serve(repository) => repository,
            GitPlan::Create => create_repository(&self.state, &repo).await?,
            GitPlan::Deny(level) => {
                warn!(
                    identity = ?self.identity.as_ref().map(Identity::fingerprint),
                    %repo,
                    %service,
                    %level,
                    "SSH repo access denied"
                );
                metrics.denied(ListenerKind::Ssh);
                reject(
                    session,
                    channel_id,
                    &format!("ERROR: access denied to repository {repo}\n"),
                );
                return Ok(());
            }
            GitPlan::NotFound => {
                reject(
                    session,
                    channel_id,
                    &format!("ERROR: repository {repo} not found\n"),
                );
                return Ok(());
            }
        };

        let invocation = GitInvocation {
            service,
            repo: repository.name(),
            repo_path: repository.path(),
            identity: self.identity.as_ref(),
            config_path: &self.state.config_path,
            protocol: self.git_protocol.as_deref(),
            stateless_rpc: false,
            advertise_refs: false,
        };
        let mut child = match invocation.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(%repo, %service, error = %e, "failed to spawn git");
                reject(session, channel_id, &format!("Failed to start {service}: {e}\n"));
                return Ok(());
            }
        };
        info!(%repo, %service, "serving git request");

        self.child_stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let handle = session.handle();

        tokio::spawn(async move {
            let stderr_task = {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Some(stderr) = stderr {
                        pump(stderr, &handle, channel_id, Some(1)).await;
                    }
                })
            };
            if let Some(stdout) = stdout {
                pump(stdout, &handle, channel_id, None).await;
            }
            let _ = stderr_task.await;

            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(1) as u32,
                Err(_) => 1,
            };
            debug!(%service, exit_code, "git child exited");

            // RFC 4254: exit-status → EOF → close.
            let _ = handle.exit_status_request(channel_id, exit_code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Every key is accepted; its fingerprint becomes the session identity.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let identity = Identity::from_public_key(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %identity,
            "SSH public-key auth"
        );
        self.identity = Some(identity);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` here before the exec request.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ref mut stdin) = self.child_stdin {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "failed to write to git stdin (process may have exited)");
                self.child_stdin.take();
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the ChildStdin closes the pipe.
        self.child_stdin.take();
        Ok(())
    }

    /// Without a command there is nothing interactive to offer; print help.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.run_command(channel_id, "help", session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data).into_owned();
        info!(
            peer = ?self.peer_addr,
            identity = ?self.identity.as_ref().map(Identity::fingerprint),
            command = %raw_cmd,
            "SSH exec request"
        );

        match parse_exec_command(&raw_cmd) {
            Some((service, repo)) => {
                if let Err(e) = self.run_git(channel_id, service, repo, session).await {
                    error!(command = %raw_cmd, error = %format!("{e:#}"), "git request failed");
                    reject(session, channel_id, &format!("ERROR: {e}\n"));
                }
            }
            None => self.run_command(channel_id, &raw_cmd, session).await,
        }
        Ok(())
    }
}
