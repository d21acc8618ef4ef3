//! Hook dispatch: the logic behind `githarbor internal hook <name>`.
//!
//! Runs in a short-lived process spawned by git, not by the server.  The
//! pushing identity and repository name come from the environment the SSH
//! session set on the `git receive-pack` child; authorization is resolved
//! through an [`AccessControl`] built from the same config and ACL file as the
//! server's.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{read_ref_updates, HookDecision, HookName, RefUpdate};
use crate::access::{AccessControl, Identity};
use crate::backend::normalize_repo_name;

/// Environment variable carrying the pushing identity's fingerprint.
pub const ENV_IDENTITY: &str = "GITHARBOR_IDENTITY";
/// Environment variable carrying the target repository name.
pub const ENV_REPO: &str = "GITHARBOR_REPO";

/// Name of the last-push record written into the repository directory.
pub const LAST_PUSH_FILE: &str = "githarbor-last-push.json";

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Who is pushing, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub repo: String,
    /// `None` when the push did not come through an authenticated session.
    pub identity: Option<Identity>,
    /// The repository's git directory (the hook's working directory).
    pub repo_dir: PathBuf,
}

impl HookContext {
    /// Recover the context propagated by the spawning session.
    ///
    /// The repository name falls back to the git directory's name when the
    /// session variable is absent.
    pub fn from_env() -> Result<Self> {
        let repo_dir = match std::env::var_os("GIT_DIR") {
            Some(dir) => std::path::absolute(PathBuf::from(dir))?,
            None => std::env::current_dir().context("failed to read working directory")?,
        };
        let repo = match std::env::var(ENV_REPO) {
            Ok(name) if !name.is_empty() => name,
            _ => repo_dir
                .file_name()
                .map(|n| normalize_repo_name(&n.to_string_lossy()).to_string())
                .unwrap_or_default(),
        };
        let identity = match std::env::var(ENV_IDENTITY) {
            Ok(fp) if !fp.is_empty() => Some(Identity::parse(&fp)?),
            _ => None,
        };
        Ok(Self {
            repo,
            identity,
            repo_dir,
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct HookDispatcher {
    access: AccessControl,
}

impl HookDispatcher {
    pub fn new(access: AccessControl) -> Self {
        Self { access }
    }

    /// Accept or reject a hook firing.  Pure apart from reading the ACL.
    ///
    /// `pre-receive` and `update` need write access; a batch is rejected as a
    /// whole if any record is malformed.  `post-receive` is always accepted,
    /// since its refs are already written.
    pub fn decide(&self, hook: HookName, updates: &[RefUpdate], ctx: &HookContext) -> HookDecision {
        if hook == HookName::PostReceive {
            return HookDecision::allow();
        }

        for update in updates {
            if let Err(e) = update.validate() {
                return HookDecision::deny(format!("rejecting push to {}: {e}", ctx.repo));
            }
        }

        let level = self.access.resolve(&ctx.repo, ctx.identity.as_ref());
        if !level.can_write() {
            let who = ctx
                .identity
                .as_ref()
                .map_or_else(|| "anonymous".to_string(), Identity::to_string);
            return HookDecision::deny(format!(
                "access denied: {who} has {level} access to {}; pushing requires read-write",
                ctx.repo
            ));
        }
        HookDecision::allow()
    }

    /// Run `hook` end to end: read its input, decide, report, apply side
    /// effects.  Returns the process exit status.
    pub fn run<R: BufRead, W: Write>(
        &self,
        hook: HookName,
        args: &[String],
        ctx: &HookContext,
        stdin: R,
        stderr: &mut W,
    ) -> i32 {
        let updates = match hook {
            HookName::Update => RefUpdate::from_update_args(args).map(|u| vec![u]),
            HookName::PreReceive | HookName::PostReceive => read_ref_updates(stdin),
        };
        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(%hook, repo = %ctx.repo, error = %e, "unreadable hook input");
                let _ = writeln!(stderr, "githarbor: {hook}: {e:#}");
                // post-receive cannot undo anything; never fail it.
                return if hook == HookName::PostReceive { 0 } else { 1 };
            }
        };

        let decision = self.decide(hook, &updates, ctx);
        info!(
            %hook,
            repo = %ctx.repo,
            identity = ?ctx.identity.as_ref().map(Identity::fingerprint),
            refs = updates.len(),
            created = updates.iter().filter(|u| u.is_create()).count(),
            deleted = updates.iter().filter(|u| u.is_delete()).count(),
            allowed = decision.allowed,
            "hook decision"
        );
        if !decision.allowed {
            let _ = writeln!(stderr, "githarbor: push rejected: {}", decision.message);
            return decision.exit_code();
        }

        if hook == HookName::PostReceive {
            post_receive_effects(ctx, &updates);
        }
        decision.exit_code()
    }
}

// ---------------------------------------------------------------------------
// post-receive side effects
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LastPush<'a> {
    identity: Option<&'a str>,
    pushed_at: chrono::DateTime<chrono::Utc>,
    refs: &'a [RefUpdate],
}

/// Best-effort: each failure is logged and ignored.
fn post_receive_effects(ctx: &HookContext, updates: &[RefUpdate]) {
    if let Err(e) = record_last_push(&ctx.repo_dir, ctx.identity.as_ref(), updates) {
        warn!(repo = %ctx.repo, error = %e, "failed to record last push");
    }
    if let Err(e) = update_server_info(&ctx.repo_dir) {
        warn!(repo = %ctx.repo, error = %e, "git update-server-info failed");
    }
}

fn record_last_push(repo_dir: &Path, identity: Option<&Identity>, refs: &[RefUpdate]) -> Result<()> {
    let record = LastPush {
        identity: identity.map(Identity::fingerprint),
        pushed_at: chrono::Utc::now(),
        refs,
    };
    let path = repo_dir.join(LAST_PUSH_FILE);
    let json = serde_json::to_vec_pretty(&record)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    debug!(path = %path.display(), "last push recorded");
    Ok(())
}

/// Refresh the auxiliary files dumb-HTTP clients rely on.
fn update_server_info(repo_dir: &Path) -> Result<()> {
    let status = Command::new("git")
        .arg("--git-dir")
        .arg(repo_dir)
        .arg("update-server-info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to spawn git update-server-info")?;
    anyhow::ensure!(status.success(), "exited with {status}");
    Ok(())
}
