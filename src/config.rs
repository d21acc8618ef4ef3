use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::access::{Identity, Visibility};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Server-wide configuration.
///
/// Loaded once per process and handed to constructors as a value.  Both the
/// long-running server and the short-lived hook dispatcher build their
/// [`AccessControl`](crate::access::AccessControl) from the same file, so the
/// two paths resolve authorization identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name used in the generated hook header and `info` output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Root directory for repositories, the ACL store and logs.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Server administrators, as authorized-key lines or `SHA256:` fingerprints.
    #[serde(default)]
    pub initial_admin_keys: Vec<String>,
    /// Visibility applied to repositories without an explicit setting.
    #[serde(default)]
    pub default_visibility: Visibility,
    /// Grant read-write instead of read-only on public repositories.
    #[serde(default)]
    pub allow_anonymous_write: bool,
    /// Shared graceful-shutdown deadline, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub git: GitDaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_name() -> String {
    "Git Harbor".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_path: default_data_path(),
            initial_admin_keys: Vec::new(),
            default_visibility: Visibility::default(),
            allow_anonymous_write: false,
            shutdown_timeout: default_shutdown_timeout(),
            ssh: SshConfig::default(),
            git: GitDaemonConfig::default(),
            http: HttpConfig::default(),
            stats: StatsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Directory holding one bare repository per entry.
    pub fn repo_path(&self) -> PathBuf {
        self.data_path.join("repos")
    }

    /// Location of the persisted per-repository ACL.
    pub fn acl_path(&self) -> PathBuf {
        self.data_path.join("acl.yaml")
    }

    /// Log file used by the hook dispatcher process.
    pub fn hook_log_path(&self) -> PathBuf {
        self.data_path.join("log").join("hooks.log")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Parse [`Config::initial_admin_keys`] into identities.
    pub fn admin_identities(&self) -> Result<Vec<Identity>> {
        self.initial_admin_keys
            .iter()
            .map(|k| Identity::parse(k).with_context(|| format!("invalid admin key: {k:?}")))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:23231`).
    #[serde(default = "default_ssh_listen")]
    pub listen_addr: String,
    /// Host private key; generated on first start when missing.
    #[serde(default = "default_ssh_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
    /// Inactivity timeout for SSH connections, in seconds.
    #[serde(default = "default_ssh_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_ssh_listen() -> String {
    "0.0.0.0:23231".to_string()
}

fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("ssh/githarbor_host_ed25519")
}

fn default_max_auth_attempts() -> usize {
    3
}

fn default_ssh_idle_timeout() -> u64 {
    600
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_ssh_listen(),
            key_path: default_ssh_key_path(),
            max_auth_attempts: default_max_auth_attempts(),
            idle_timeout: default_ssh_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitDaemonConfig {
    /// Socket address for the raw `git://` listener.
    #[serde(default = "default_git_listen")]
    pub listen_addr: String,
    /// Seconds to wait for the client's request line.
    #[serde(default = "default_git_idle_timeout")]
    pub idle_timeout: u64,
    /// Concurrent connections served before new ones are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_git_listen() -> String {
    "0.0.0.0:9418".to_string()
}

fn default_git_idle_timeout() -> u64 {
    3
}

fn default_max_connections() -> usize {
    32
}

impl Default for GitDaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_git_listen(),
            idle_timeout: default_git_idle_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen_addr: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:23232".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_listen")]
    pub listen_addr: String,
}

fn default_stats_listen() -> String {
    "0.0.0.0:23233".to_string()
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_stats_listen(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
///
/// Relative paths inside the file are resolved against the file's directory.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    let base = config_dir(path)?;
    absolutize(&mut config, &base);
    validate_config(&config)?;
    Ok(config)
}

/// Load the config at `path`, first writing a default one if it is missing.
///
/// The default's data path is the directory containing the config file.
pub fn load_or_init_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        let base = config_dir(path)?;
        std::fs::create_dir_all(&base)
            .with_context(|| format!("failed to create config directory: {}", base.display()))?;
        let config = Config {
            data_path: base,
            ..Config::default()
        };
        let yaml = serde_yaml::to_string(&config).context("failed to encode default config")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("failed to write default config: {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote default config");
    }
    load_config(path)
}

fn config_dir(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path)
        .with_context(|| format!("failed to resolve config path: {}", path.display()))?;
    Ok(path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/")))
}

fn absolutize(config: &mut Config, base: &Path) {
    if config.data_path.is_relative() {
        config.data_path = base.join(&config.data_path);
    }
    if config.ssh.key_path.is_relative() {
        config.ssh.key_path = config.data_path.join(&config.ssh.key_path);
    }
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.shutdown_timeout > 0, "shutdown_timeout must be > 0");
    anyhow::ensure!(
        config.git.max_connections > 0,
        "git.max_connections must be > 0"
    );
    for (name, addr) in [
        ("ssh", &config.ssh.listen_addr),
        ("git", &config.git.listen_addr),
        ("http", &config.http.listen_addr),
        ("stats", &config.stats.listen_addr),
    ] {
        addr.parse::<SocketAddr>()
            .with_context(|| format!("invalid {name}.listen_addr: {addr:?}"))?;
    }
    config.admin_identities()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_default_config_with_absolute_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");

        let config = load_or_init_config(&path).unwrap();

        assert!(path.is_file());
        assert_eq!(config.data_path, tmp.path());
        assert_eq!(config.repo_path(), tmp.path().join("repos"));
        assert!(config.ssh.key_path.is_absolute());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn relative_data_path_resolves_against_config_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "data_path: srv\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.data_path, tmp.path().join("srv"));
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "http:\n  listen_addr: not-an-address\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("http.listen_addr"));
    }

    #[test]
    fn rejects_zero_shutdown_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "shutdown_timeout: 0\n").unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_unparseable_admin_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "initial_admin_keys:\n  - garbage\n").unwrap();

        assert!(load_config(&path).is_err());
    }
}
