//! Git transport services and the child processes that implement them.

use std::path::Path;
use std::process::Stdio;

use prometheus_client::encoding::EncodeLabelValue;
use tokio::process::Command;

use crate::access::{AccessLevel, Identity};
use crate::backend::normalize_repo_name;
use crate::hooks::dispatch::{ENV_IDENTITY, ENV_REPO};

/// Environment variable carrying the config path into hook processes.
pub const ENV_CONFIG: &str = "GITHARBOR_CONFIG";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum GitService {
    UploadPack,
    ReceivePack,
    UploadArchive,
}

impl GitService {
    /// Name as it appears on the wire, e.g. `git-upload-pack`.
    pub fn as_str(&self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::ReceivePack => "git-receive-pack",
            GitService::UploadArchive => "git-upload-archive",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(GitService::UploadPack),
            "git-receive-pack" => Some(GitService::ReceivePack),
            "git-upload-archive" => Some(GitService::UploadArchive),
            _ => None,
        }
    }

    /// Minimum access level needed to run the service.
    pub fn required_access(&self) -> AccessLevel {
        match self {
            GitService::ReceivePack => AccessLevel::ReadWrite,
            GitService::UploadPack | GitService::UploadArchive => AccessLevel::ReadOnly,
        }
    }

    /// `git` subcommand, e.g. `upload-pack`.
    fn subcommand(&self) -> &'static str {
        &self.as_str()["git-".len()..]
    }
}

impl std::fmt::Display for GitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an SSH exec request such as `git-upload-pack '/widgets.git'` or
/// `git upload-pack widgets`.
///
/// Returns the service and the normalized repository name.  Anything else
/// (including an empty repository path) is `None` and is handed to the
/// session command router instead.
pub fn parse_exec_command(cmd: &str) -> Option<(GitService, String)> {
    let cmd = cmd.trim();
    let cmd = match cmd.strip_prefix("git ") {
        Some(rest) => format!("git-{}", rest.trim_start()),
        None => cmd.to_string(),
    };
    let (name, rest) = cmd.split_once(char::is_whitespace)?;
    let service = GitService::from_name(name)?;
    let repo = normalize_repo_name(rest);
    if repo.is_empty() {
        return None;
    }
    Some((service, repo.to_string()))
}

/// Everything a git child process needs besides its I/O.
pub struct GitInvocation<'a> {
    pub service: GitService,
    pub repo: &'a str,
    pub repo_path: &'a Path,
    pub identity: Option<&'a Identity>,
    pub config_path: &'a Path,
    pub protocol: Option<&'a str>,
    pub stateless_rpc: bool,
    pub advertise_refs: bool,
}

impl GitInvocation<'_> {
    /// A piped `git <service>` command with the hook environment set.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg(self.service.subcommand());
        if self.service == GitService::UploadPack {
            cmd.arg("--strict");
        }
        if self.stateless_rpc {
            cmd.arg("--stateless-rpc");
        }
        if self.advertise_refs {
            cmd.arg("--advertise-refs");
        }
        cmd.arg(self.repo_path);

        cmd.env(ENV_CONFIG, self.config_path).env(ENV_REPO, self.repo);
        match self.identity {
            Some(id) => cmd.env(ENV_IDENTITY, id.fingerprint()),
            None => cmd.env_remove(ENV_IDENTITY),
        };
        if let Some(proto) = self.protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dashed_and_spaced_forms() {
        assert_eq!(
            parse_exec_command("git-upload-pack '/widgets.git'"),
            Some((GitService::UploadPack, "widgets".to_string()))
        );
        assert_eq!(
            parse_exec_command("git receive-pack 'widgets'"),
            Some((GitService::ReceivePack, "widgets".to_string()))
        );
        assert_eq!(
            parse_exec_command("git-upload-archive \"widgets.git\""),
            Some((GitService::UploadArchive, "widgets".to_string()))
        );
    }

    #[test]
    fn non_git_commands_are_not_parsed() {
        assert!(parse_exec_command("repo list").is_none());
        assert!(parse_exec_command("git-upload-pack ''").is_none());
        assert!(parse_exec_command("git-upload-pack").is_none());
        assert!(parse_exec_command("git-frobnicate 'x'").is_none());
    }

    #[test]
    fn push_needs_write_access() {
        assert_eq!(GitService::ReceivePack.required_access(), AccessLevel::ReadWrite);
        assert_eq!(GitService::UploadPack.required_access(), AccessLevel::ReadOnly);
        assert_eq!(GitService::UploadPack.subcommand(), "upload-pack");
    }

    #[test]
    fn command_carries_hook_environment() {
        let id = Identity::parse("SHA256:abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG").unwrap();
        let inv = GitInvocation {
            service: GitService::ReceivePack,
            repo: "widgets",
            repo_path: Path::new("/srv/repos/widgets.git"),
            identity: Some(&id),
            config_path: Path::new("/srv/config.yaml"),
            protocol: Some("version=2"),
            stateless_rpc: false,
            advertise_refs: false,
        };
        let cmd = inv.command();
        let std = cmd.as_std();
        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["receive-pack", "/srv/repos/widgets.git"]);
        let env: Vec<_> = std
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(env.contains(&(ENV_REPO.to_string(), "widgets".to_string())));
        assert!(env.contains(&(ENV_IDENTITY.to_string(), id.fingerprint().to_string())));
        assert!(env.contains(&(ENV_CONFIG.to_string(), "/srv/config.yaml".to_string())));
    }
}
