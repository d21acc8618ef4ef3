//! Access control: identities, access levels and the per-repository ACL.
//!
//! [`AccessControl::resolve`] is the single authorization decision used by the
//! SSH session router, the git transports and the hook dispatcher.  The ACL is
//! published as an immutable snapshot; writers build a new snapshot, persist it
//! to disk and swap it in, so readers never observe a partial update and a
//! separately spawned hook process reads the same state.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::Config;

// ---------------------------------------------------------------------------
// Access level
// ---------------------------------------------------------------------------

/// Ordered permission tier.  Comparisons use ordinal rank.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    #[default]
    NoAccess = 0,
    ReadOnly = 1,
    ReadWrite = 2,
    Admin = 3,
}

impl AccessLevel {
    pub fn can_read(&self) -> bool {
        *self >= AccessLevel::ReadOnly
    }

    pub fn can_write(&self) -> bool {
        *self >= AccessLevel::ReadWrite
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessLevel::NoAccess => "no-access",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ReadWrite => "read-write",
            AccessLevel::Admin => "admin",
        })
    }
}

impl FromStr for AccessLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "no-access" | "none" => AccessLevel::NoAccess,
            "read-only" | "read" => AccessLevel::ReadOnly,
            "read-write" | "write" => AccessLevel::ReadWrite,
            "admin" | "admin-access" => AccessLevel::Admin,
            other => bail!("unknown access level: {other:?}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A connecting actor, identified by the SHA-256 fingerprint of its public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Fingerprint in the `SHA256:<base64>` form printed by `ssh-keygen -l`.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(key.public_key_base64().as_bytes())
            .unwrap_or_default();
        Self::from_key_blob(&blob)
    }

    fn from_key_blob(blob: &[u8]) -> Self {
        let hash = Sha256::digest(blob);
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
        Self(format!("SHA256:{encoded}"))
    }

    /// Accept either a `SHA256:` fingerprint or an authorized-key line
    /// (`ssh-ed25519 AAAA... [comment]`).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(fp) = s.strip_prefix("SHA256:") {
            if fp.is_empty() {
                bail!("empty fingerprint");
            }
            return Ok(Self(s.to_string()));
        }
        let mut parts = s.split_whitespace();
        let (Some(kind), Some(blob)) = (parts.next(), parts.next()) else {
            bail!("expected `<key-type> <base64>` or `SHA256:<fingerprint>`");
        };
        if !(kind.starts_with("ssh-") || kind.starts_with("ecdsa-") || kind.starts_with("sk-")) {
            bail!("unsupported key type: {kind}");
        }
        let blob = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .context("key blob is not valid base64")?;
        Ok(Self::from_key_blob(&blob))
    }

    pub fn fingerprint(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ACL snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Settings for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoAcl {
    /// Explicit visibility; `None` falls back to the server default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub collaborators: BTreeMap<Identity, AccessLevel>,
}

/// Immutable view of every repository's ACL, as persisted in `acl.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSnapshot {
    #[serde(default)]
    pub repos: BTreeMap<String, RepoAcl>,
}

impl AclSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse ACL file: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read ACL file: {}", path.display()))
            }
        }
    }

    /// Write to a temp file in the same directory and rename it over `path`.
    fn persist(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .context("ACL path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let yaml = serde_yaml::to_string(self).context("failed to encode ACL")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create temp file for ACL")?;
        tmp.write_all(yaml.as_bytes())
            .context("failed to write ACL")?;
        tmp.persist(path)
            .with_context(|| format!("failed to replace ACL file: {}", path.display()))?;
        Ok(())
    }
}

/// Names the backend can map to a directory directly under the repo root.
pub fn is_valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Resolves an [`AccessLevel`] for an (identity, repository) pair.
pub struct AccessControl {
    admins: HashSet<Identity>,
    default_visibility: Visibility,
    allow_anonymous_write: bool,
    store_path: PathBuf,
    snapshot: RwLock<Arc<AclSnapshot>>,
    /// Serializes writers; readers only take the snapshot lock.
    write_lock: Mutex<()>,
}

impl AccessControl {
    /// Build the controller from `config`, loading the persisted ACL.
    pub fn open(config: &Config) -> Result<Self> {
        let snapshot = AclSnapshot::load(&config.acl_path())?;
        Ok(Self {
            admins: config.admin_identities()?.into_iter().collect(),
            default_visibility: config.default_visibility,
            allow_anonymous_write: config.allow_anonymous_write,
            store_path: config.acl_path(),
            snapshot: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
        })
    }

    /// The current ACL snapshot.
    pub fn snapshot(&self) -> Arc<AclSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Resolve the access level of `identity` (or an anonymous caller) on
    /// `repo`.  First match wins:
    ///
    /// 1. server administrator → `Admin`
    /// 2. explicit per-identity entry → that level
    /// 3. private repository → `NoAccess`
    /// 4. public repository → `ReadOnly`, or `ReadWrite` with anonymous write
    /// 5. anything else (invalid repository names) → `NoAccess`
    pub fn resolve(&self, repo: &str, identity: Option<&Identity>) -> AccessLevel {
        if let Some(id) = identity {
            if self.admins.contains(id) {
                return AccessLevel::Admin;
            }
        }
        if !is_valid_repo_name(repo) {
            return AccessLevel::NoAccess;
        }

        let snapshot = self.snapshot();
        let acl = snapshot.repos.get(repo);
        if let (Some(acl), Some(id)) = (acl, identity) {
            if let Some(level) = acl.collaborators.get(id) {
                return *level;
            }
        }

        match acl
            .and_then(|a| a.visibility)
            .unwrap_or(self.default_visibility)
        {
            Visibility::Private => AccessLevel::NoAccess,
            Visibility::Public if self.allow_anonymous_write => AccessLevel::ReadWrite,
            Visibility::Public => AccessLevel::ReadOnly,
        }
    }

    pub fn is_admin(&self, identity: &Identity) -> bool {
        self.admins.contains(identity)
    }

    pub fn visibility(&self, repo: &str) -> Visibility {
        self.snapshot()
            .repos
            .get(repo)
            .and_then(|a| a.visibility)
            .unwrap_or(self.default_visibility)
    }

    pub fn collaborators(&self, repo: &str) -> Vec<(Identity, AccessLevel)> {
        self.snapshot()
            .repos
            .get(repo)
            .map(|a| {
                a.collaborators
                    .iter()
                    .map(|(id, level)| (id.clone(), *level))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_visibility(&self, repo: &str, visibility: Visibility) -> Result<()> {
        self.update(|acl| {
            acl.repos.entry(repo.to_string()).or_default().visibility = Some(visibility);
        })?;
        info!(repo, ?visibility, "repository visibility changed");
        Ok(())
    }

    pub fn set_collaborator(&self, repo: &str, identity: Identity, level: AccessLevel) -> Result<()> {
        info!(repo, identity = %identity, %level, "collaborator set");
        self.update(|acl| {
            acl.repos
                .entry(repo.to_string())
                .or_default()
                .collaborators
                .insert(identity, level);
        })
    }

    /// Returns `false` when `identity` had no entry on `repo`.
    pub fn remove_collaborator(&self, repo: &str, identity: &Identity) -> Result<bool> {
        let mut removed = false;
        self.update(|acl| {
            if let Some(entry) = acl.repos.get_mut(repo) {
                removed = entry.collaborators.remove(identity).is_some();
            }
        })?;
        debug!(repo, identity = %identity, removed, "collaborator remove");
        Ok(removed)
    }

    /// Copy-on-write mutation: clone, modify, persist, then publish.
    fn update<F: FnOnce(&mut AclSnapshot)>(&self, f: F) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        f(&mut next);
        next.persist(&self.store_path)?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const ADMIN_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJI/1tawpdPmzuJcTGTJ+QReqB6cRUdKj4iQIdJUFdrl admin";

    /// Config rooted at `data` with every listener on an ephemeral port.
    pub fn test_config(data: &Path) -> Config {
        let mut config = Config {
            data_path: data.to_path_buf(),
            initial_admin_keys: vec![ADMIN_KEY.to_string()],
            ..Config::default()
        };
        for addr in [
            &mut config.ssh.listen_addr,
            &mut config.git.listen_addr,
            &mut config.http.listen_addr,
            &mut config.stats.listen_addr,
        ] {
            *addr = "127.0.0.1:0".to_string();
        }
        config
    }

    pub fn user(n: u8) -> Identity {
        Identity::from_key_blob(&[n; 32])
    }

    pub fn admin() -> Identity {
        Identity::parse(ADMIN_KEY).unwrap()
    }

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::NoAccess < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadWrite < AccessLevel::Admin);
        assert_eq!(AccessLevel::default(), AccessLevel::NoAccess);
    }

    #[test]
    fn access_level_parse() {
        assert_eq!("read-only".parse::<AccessLevel>().unwrap(), AccessLevel::ReadOnly);
        assert_eq!("write".parse::<AccessLevel>().unwrap(), AccessLevel::ReadWrite);
        assert_eq!("admin".parse::<AccessLevel>().unwrap(), AccessLevel::Admin);
        assert!("gibberish".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn identity_parse_key_line_and_fingerprint_agree() {
        let from_line = admin();
        assert!(from_line.fingerprint().starts_with("SHA256:"));
        let from_fp = Identity::parse(from_line.fingerprint()).unwrap();
        assert_eq!(from_line, from_fp);
    }

    #[test]
    fn identity_parse_rejects_garbage() {
        assert!(Identity::parse("garbage").is_err());
        assert!(Identity::parse("ssh-ed25519 !!!notbase64").is_err());
        assert!(Identity::parse("SHA256:").is_err());
    }

    #[test]
    fn admin_always_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let ac = AccessControl::open(&test_config(tmp.path())).unwrap();
        ac.set_visibility("repo", Visibility::Private).unwrap();
        ac.set_collaborator("repo", admin(), AccessLevel::NoAccess).unwrap();

        assert_eq!(ac.resolve("repo", Some(&admin())), AccessLevel::Admin);
        assert_eq!(ac.resolve("missing", Some(&admin())), AccessLevel::Admin);
    }

    #[test]
    fn explicit_entry_beats_visibility() {
        let tmp = tempfile::tempdir().unwrap();
        let ac = AccessControl::open(&test_config(tmp.path())).unwrap();
        ac.set_visibility("repo", Visibility::Private).unwrap();
        ac.set_collaborator("repo", user(1), AccessLevel::ReadWrite).unwrap();

        assert_eq!(ac.resolve("repo", Some(&user(1))), AccessLevel::ReadWrite);
        assert_eq!(ac.resolve("repo", Some(&user(2))), AccessLevel::NoAccess);
        assert_eq!(ac.resolve("repo", None), AccessLevel::NoAccess);
    }

    #[test]
    fn public_repo_read_only_unless_anonymous_write() {
        let tmp = tempfile::tempdir().unwrap();
        let ac = AccessControl::open(&test_config(tmp.path())).unwrap();
        assert_eq!(ac.resolve("repo", Some(&user(1))), AccessLevel::ReadOnly);
        assert_eq!(ac.resolve("repo", None), AccessLevel::ReadOnly);

        let config = Config {
            allow_anonymous_write: true,
            ..test_config(tmp.path())
        };
        let ac = AccessControl::open(&config).unwrap();
        assert_eq!(ac.resolve("repo", Some(&user(1))), AccessLevel::ReadWrite);
    }

    #[test]
    fn private_default_visibility() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            default_visibility: Visibility::Private,
            ..test_config(tmp.path())
        };
        let ac = AccessControl::open(&config).unwrap();
        assert_eq!(ac.resolve("repo", Some(&user(1))), AccessLevel::NoAccess);
        ac.set_visibility("repo", Visibility::Public).unwrap();
        assert_eq!(ac.resolve("repo", Some(&user(1))), AccessLevel::ReadOnly);
    }

    #[test]
    fn invalid_repo_names_resolve_to_no_access() {
        let tmp = tempfile::tempdir().unwrap();
        let ac = AccessControl::open(&test_config(tmp.path())).unwrap();
        for name in ["", "../etc", "a/b", ".hidden"] {
            assert_eq!(ac.resolve(name, Some(&user(1))), AccessLevel::NoAccess, "{name}");
        }
    }

    #[test]
    fn resolve_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let ac = AccessControl::open(&test_config(tmp.path())).unwrap();
        ac.set_collaborator("repo", user(3), AccessLevel::ReadWrite).unwrap();
        let ids = [None, Some(user(1)), Some(user(3)), Some(admin())];
        for repo in ["repo", "other", ""] {
            for id in &ids {
                let first = ac.resolve(repo, id.as_ref());
                for _ in 0..10 {
                    assert_eq!(ac.resolve(repo, id.as_ref()), first);
                }
            }
        }
    }

    #[test]
    fn mutations_are_persisted_for_other_processes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let ac = AccessControl::open(&config).unwrap();
        ac.set_visibility("repo", Visibility::Private).unwrap();
        ac.set_collaborator("repo", user(1), AccessLevel::ReadWrite).unwrap();

        let reopened = AccessControl::open(&config).unwrap();
        assert_eq!(reopened.resolve("repo", Some(&user(1))), AccessLevel::ReadWrite);
        assert_eq!(reopened.resolve("repo", Some(&user(2))), AccessLevel::NoAccess);

        assert!(reopened.remove_collaborator("repo", &user(1)).unwrap());
        assert!(!reopened.remove_collaborator("repo", &user(1)).unwrap());
        assert_eq!(reopened.resolve("repo", Some(&user(1))), AccessLevel::NoAccess);
    }

    #[test]
    fn concurrent_readers_see_whole_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let ac = Arc::new(AccessControl::open(&test_config(tmp.path())).unwrap());
        ac.set_visibility("repo", Visibility::Private).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let ac = Arc::clone(&ac);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snap = ac.snapshot();
                        if let Some(acl) = snap.repos.get("repo") {
                            // Both collaborators are added in one update.
                            let n = acl.collaborators.len();
                            assert!(n == 0 || n == 2, "partial snapshot: {n}");
                        }
                    }
                })
            })
            .collect();

        for i in 0..20u8 {
            ac.update(|acl| {
                let entry = acl.repos.entry("repo".into()).or_default();
                entry.collaborators.clear();
                entry.collaborators.insert(user(i), AccessLevel::ReadOnly);
                entry.collaborators.insert(user(i + 100), AccessLevel::ReadWrite);
            })
            .unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
