//! Session command router.
//!
//! Every non-git SSH exec request lands here.  The leading token picks a
//! command, the command declares the minimum [`AccessLevel`] it needs, and
//! [`AccessControl::resolve`] is consulted before any handler code runs.
//! Handlers that take a repository check that it exists on their own, so a
//! missing repository and a refused caller stay separate failures.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, instrument, warn};

use crate::access::{AccessControl, AccessLevel, Identity, Visibility};
use crate::backend::{normalize_repo_name, Backend, Repository};
use crate::render::{self, RenderOptions};

/// Leading tokens the router understands.
const COMMANDS: &[&str] = &["help", "info", "repo", "show", "cat", "collab"];

const HELP: &str = "\
Commands:
  help                                  show this help
  info                                  show your identity
  repo list                             list repositories you can read
  repo private <repo> [true|false]      get or set repository visibility
  show <repo>/<path> [-l] [-c]          print a file at HEAD (alias: cat)
  collab list <repo>                    list collaborators
  collab add <repo> <key> <level>       grant a key access to a repository
  collab remove <repo> <key>            revoke a key's access
";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("{0}")]
    Usage(String),
    #[error("unauthorized: {command} requires {required} access")]
    Unauthorized {
        command: &'static str,
        required: AccessLevel,
    },
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    /// Exit status reported on the SSH channel.
    pub fn exit_status(&self) -> u32 {
        match self {
            CommandError::UnknownCommand(_) => 127,
            CommandError::Usage(_) => 2,
            CommandError::Unauthorized { .. } => 3,
            CommandError::RepositoryNotFound(_) => 4,
            CommandError::Internal(_) => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Command grammar
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ssh", no_binary_name = true, disable_help_subcommand = true)]
struct SessionCli {
    #[command(subcommand)]
    command: SessionCommand,
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    Help,
    Info,
    #[command(subcommand)]
    Repo(RepoCommand),
    #[command(visible_alias = "cat")]
    Show {
        /// `<repo>[.git]/<path>`
        target: String,
        #[arg(short = 'l', long = "linenumber")]
        line_numbers: bool,
        #[arg(short = 'c', long = "color")]
        color: bool,
    },
    #[command(subcommand)]
    Collab(CollabCommand),
}

#[derive(Subcommand, Debug)]
enum RepoCommand {
    List,
    Private { repo: String, value: Option<bool> },
}

#[derive(Subcommand, Debug)]
enum CollabCommand {
    List { repo: String },
    Add { repo: String, key: String, level: String },
    Remove { repo: String, key: String },
}

impl SessionCommand {
    fn name(&self) -> &'static str {
        match self {
            SessionCommand::Help => "help",
            SessionCommand::Info => "info",
            SessionCommand::Repo(RepoCommand::List) => "repo list",
            SessionCommand::Repo(RepoCommand::Private { .. }) => "repo private",
            SessionCommand::Show { .. } => "show",
            SessionCommand::Collab(CollabCommand::List { .. }) => "collab list",
            SessionCommand::Collab(CollabCommand::Add { .. }) => "collab add",
            SessionCommand::Collab(CollabCommand::Remove { .. }) => "collab remove",
        }
    }

    fn required_access(&self) -> AccessLevel {
        match self {
            SessionCommand::Help | SessionCommand::Info | SessionCommand::Repo(RepoCommand::List) => {
                AccessLevel::NoAccess
            }
            SessionCommand::Show { .. } => AccessLevel::ReadOnly,
            SessionCommand::Repo(RepoCommand::Private { .. }) | SessionCommand::Collab(_) => {
                AccessLevel::Admin
            }
        }
    }

    /// Repository the command operates on, normalized.
    fn repo(&self) -> Option<&str> {
        match self {
            SessionCommand::Help | SessionCommand::Info | SessionCommand::Repo(RepoCommand::List) => {
                None
            }
            SessionCommand::Show { target, .. } => {
                Some(split_target(target).map_or_else(|| normalize_repo_name(target), |(repo, _)| repo))
            }
            SessionCommand::Repo(RepoCommand::Private { repo, .. })
            | SessionCommand::Collab(CollabCommand::List { repo })
            | SessionCommand::Collab(CollabCommand::Add { repo, .. })
            | SessionCommand::Collab(CollabCommand::Remove { repo, .. }) => {
                Some(normalize_repo_name(repo))
            }
        }
    }
}

/// Split `repo.git/path/to/file` into `("repo", "path/to/file")`.
fn split_target(target: &str) -> Option<(&str, &str)> {
    let (repo, path) = target.trim_start_matches('/').split_once('/')?;
    let repo = normalize_repo_name(repo);
    if repo.is_empty() || path.is_empty() {
        return None;
    }
    Some((repo, path))
}

/// Metric label for a command line: its known leading command, or
/// `unknown`.  Labels never carry client-chosen text.
pub fn command_name(line: &str) -> &'static str {
    let leading = line.split_whitespace().next().unwrap_or("");
    COMMANDS
        .iter()
        .copied()
        .find(|c| *c == leading)
        .unwrap_or("unknown")
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct CommandRouter {
    server_name: String,
    access: Arc<AccessControl>,
    backend: Arc<dyn Backend>,
}

impl CommandRouter {
    pub fn new(server_name: impl Into<String>, access: Arc<AccessControl>, backend: Arc<dyn Backend>) -> Self {
        Self {
            server_name: server_name.into(),
            access,
            backend,
        }
    }

    /// Run one command line on behalf of `identity`, appending its output to
    /// `out`.
    #[instrument(skip(self, identity, out), fields(identity = ?identity.map(Identity::fingerprint)))]
    pub async fn dispatch(
        &self,
        line: &str,
        identity: Option<&Identity>,
        out: &mut String,
    ) -> Result<(), CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let leading = tokens.first().copied().unwrap_or("");
        if !COMMANDS.contains(&leading) {
            return Err(CommandError::UnknownCommand(leading.to_string()));
        }

        let cli = SessionCli::try_parse_from(tokens.iter().copied())
            .map_err(|e| CommandError::Usage(e.render().to_string()))?;
        let command = cli.command;

        let required = command.required_access();
        if required > AccessLevel::NoAccess {
            let repo = command.repo().unwrap_or_default();
            let level = self.access.resolve(repo, identity);
            if level < required {
                warn!(command = command.name(), repo, %level, %required, "command refused");
                return Err(CommandError::Unauthorized {
                    command: command.name(),
                    required,
                });
            }
        }
        debug!(command = command.name(), "command authorized");

        match command {
            SessionCommand::Help => out.push_str(HELP),
            SessionCommand::Info => self.info(identity, out),
            SessionCommand::Repo(RepoCommand::List) => self.repo_list(identity, out).await?,
            SessionCommand::Repo(RepoCommand::Private { repo, value }) => {
                self.repo_private(&repo, value, out).await?
            }
            SessionCommand::Show {
                target,
                line_numbers,
                color,
            } => {
                let opts = RenderOptions { line_numbers, color };
                self.show(&target, opts, out).await?
            }
            SessionCommand::Collab(cmd) => self.collab(cmd, out).await?,
        }
        Ok(())
    }

    async fn existing(&self, repo: &str) -> Result<Repository, CommandError> {
        self.backend
            .repository(repo)
            .await?
            .ok_or_else(|| CommandError::RepositoryNotFound(repo.to_string()))
    }

    fn info(&self, identity: Option<&Identity>, out: &mut String) {
        out.push_str(&format!("Server: {}\n", self.server_name));
        match identity {
            Some(id) => {
                out.push_str(&format!("Identity: {id}\n"));
                out.push_str(&format!("Admin: {}\n", self.access.is_admin(id)));
            }
            None => out.push_str("Identity: anonymous\n"),
        }
    }

    async fn repo_list(&self, identity: Option<&Identity>, out: &mut String) -> Result<(), CommandError> {
        for repo in self.backend.repositories().await? {
            if self.access.resolve(repo.name(), identity).can_read() {
                out.push_str(repo.name());
                out.push('\n');
            }
        }
        Ok(())
    }

    async fn repo_private(&self, repo: &str, value: Option<bool>, out: &mut String) -> Result<(), CommandError> {
        let repo = normalize_repo_name(repo);
        self.existing(repo).await?;
        match value {
            Some(private) => {
                let visibility = if private {
                    Visibility::Private
                } else {
                    Visibility::Public
                };
                self.access.set_visibility(repo, visibility)?;
            }
            None => {
                let private = self.access.visibility(repo) == Visibility::Private;
                out.push_str(&format!("{private}\n"));
            }
        }
        Ok(())
    }

    async fn show(&self, target: &str, opts: RenderOptions, out: &mut String) -> Result<(), CommandError> {
        let (repo, path) = split_target(target)
            .ok_or_else(|| CommandError::Usage(format!("expected <repo>/<path>, got {target:?}")))?;
        let repo = self.existing(repo).await?;
        let content = self.backend.latest_file(&repo, path).await?;
        out.push_str(&render::render(&content, opts));
        Ok(())
    }

    async fn collab(&self, cmd: CollabCommand, out: &mut String) -> Result<(), CommandError> {
        match cmd {
            CollabCommand::List { repo } => {
                let repo = normalize_repo_name(&repo);
                self.existing(repo).await?;
                for (id, level) in self.access.collaborators(repo) {
                    out.push_str(&format!("{id}\t{level}\n"));
                }
            }
            CollabCommand::Add { repo, key, level } => {
                let repo = normalize_repo_name(&repo);
                self.existing(repo).await?;
                let identity = Identity::parse(&key).map_err(|e| CommandError::Usage(e.to_string()))?;
                let level: AccessLevel = level.parse().map_err(|e: anyhow::Error| CommandError::Usage(e.to_string()))?;
                self.access.set_collaborator(repo, identity, level)?;
            }
            CollabCommand::Remove { repo, key } => {
                let repo = normalize_repo_name(&repo);
                self.existing(repo).await?;
                let identity = Identity::parse(&key).map_err(|e| CommandError::Usage(e.to_string()))?;
                if !self.access.remove_collaborator(repo, &identity)? {
                    out.push_str(&format!("{identity} is not a collaborator on {repo}\n"));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
