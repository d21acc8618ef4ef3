//! Repository storage backend.
//!
//! The server only needs to enumerate repositories, check that one exists,
//! read a file at the tip of `HEAD` and create an empty bare repository on
//! first push.  Everything object-level is delegated to the `git` binary
//! using `tokio::process::Command`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::access::is_valid_repo_name;

/// A bare repository directly under the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    name: String,
    path: PathBuf,
}

impl Repository {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Name without the `.git` suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Strip surrounding slashes and a trailing `.git` from a client-supplied
/// repository path.
pub fn normalize_repo_name(raw: &str) -> &str {
    let raw = raw.trim().trim_matches('\'').trim_matches('"');
    let raw = raw.trim_start_matches('/').trim_end_matches('/');
    raw.strip_suffix(".git").unwrap_or(raw)
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Every repository currently stored.
    async fn repositories(&self) -> Result<Vec<Repository>>;

    /// Look up a single repository by name.
    async fn repository(&self, name: &str) -> Result<Option<Repository>> {
        Ok(self
            .repositories()
            .await?
            .into_iter()
            .find(|r| r.name() == name))
    }

    /// Contents of `path` at the tip of `HEAD`.
    async fn latest_file(&self, repo: &Repository, path: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Bare repositories stored as `{root}/{name}.git`.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// On-disk location for a repository named `name`.
    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.git"))
    }

    /// Initialise an empty bare repository named `name`.
    ///
    /// If a valid bare repo already exists this is a no-op.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str) -> Result<Repository> {
        if !is_valid_repo_name(name) {
            bail!("invalid repository name: {name:?}");
        }
        let path = self.repo_path(name);
        if is_bare_repo(&path) {
            debug!("bare repo already exists; skipping init");
            return Ok(Repository::new(name, path));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create repo root: {}", self.root.display()))?;

        let output = Command::new("git")
            .arg("init")
            .arg("--bare")
            .arg("--quiet")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn git init --bare")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git init --bare failed (status {}): {}",
                output.status,
                stderr.trim(),
            );
        }

        debug!(path = %path.display(), "bare repo initialised");
        Ok(Repository::new(name, path))
    }
}

/// A bare repo must be a directory that contains a `HEAD` file.  This is a
/// lightweight heuristic, not a full integrity check.
fn is_bare_repo(path: &Path) -> bool {
    path.is_dir() && path.join("HEAD").is_file()
}

#[async_trait::async_trait]
impl Backend for FsBackend {
    async fn repositories(&self) -> Result<Vec<Repository>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to list repos in {}", self.root.display()))
            }
        };

        let mut repos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_bare_repo(&path) {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let name = file_name.strip_suffix(".git").unwrap_or(&file_name);
            repos.push(Repository::new(name, path));
        }
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    async fn repository(&self, name: &str) -> Result<Option<Repository>> {
        if !is_valid_repo_name(name) {
            return Ok(None);
        }
        let path = self.repo_path(name);
        Ok(is_bare_repo(&path).then(|| Repository::new(name, path)))
    }

    #[instrument(skip(self, repo), fields(repo = %repo.name()))]
    async fn latest_file(&self, repo: &Repository, path: &str) -> Result<String> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(repo.path())
            .arg("show")
            .arg(format!("HEAD:{path}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn git show")?;

        if !output.status.success() {
            bail!("file not found: {path}");
        }
        String::from_utf8(output.stdout).with_context(|| format!("{path} is not valid UTF-8"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
