//! Hook script provisioning.
//!
//! Writes a `pre-receive`, `update` and `post-receive` script into the hooks
//! directory of every repository.  Each script only re-invokes the server
//! binary; all hook logic lives in [`super::dispatch`].
//!
//! Scripts are written to a temp file in the hooks directory and renamed into
//! place, so a re-run replaces stale scripts wholesale.  The first filesystem
//! failure aborts the whole run.

use std::io::{self, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use tracing::{debug, info, instrument};

use super::HookName;

/// Provisioning runs are serialized process-wide.
static PROVISION_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Readable and executable by whichever user git runs hooks as.
const HOOK_MODE: u32 = 0o755;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to determine the server executable path")]
    CurrentExe(#[source] io::Error),
    #[error("failed to read repository root {}", path.display())]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create hooks directory {}", path.display())]
    CreateHooksDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write hook {}", path.display())]
    WriteHook {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Renders and installs hook scripts pointing at one executable.
#[derive(Debug, Clone)]
pub struct HookProvisioner {
    executable: PathBuf,
    server_name: String,
}

impl HookProvisioner {
    pub fn new(executable: impl Into<PathBuf>, server_name: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            server_name: server_name.into(),
        }
    }

    /// Provisioner for the currently running binary.
    pub fn for_current_exe(server_name: impl Into<String>) -> Result<Self, ProvisionError> {
        let exe = std::env::current_exe().map_err(ProvisionError::CurrentExe)?;
        Ok(Self::new(exe, server_name))
    }

    /// The script text for `hook`.
    pub fn render(&self, hook: HookName) -> String {
        let args = match hook {
            HookName::Update => r#" "$1" "$2" "$3""#,
            HookName::PreReceive | HookName::PostReceive => "",
        };
        // The name lands in a comment line; a newline would end it.
        let banner: String = self
            .server_name
            .chars()
            .filter(|c| !c.is_control())
            .collect();
        format!(
            "#!/usr/bin/env bash\n\
             # AUTO GENERATED BY {}, DO NOT MODIFY\n\
             exec {} internal hook {}{}\n",
            banner.to_uppercase(),
            shell_quote(&self.executable.to_string_lossy()),
            hook,
            args,
        )
    }

    /// Provision every repository directory directly under `root`.
    ///
    /// Returns the number of repositories provisioned.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub fn provision(&self, root: &Path) -> Result<usize, ProvisionError> {
        let _guard = PROVISION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let read_root = |source| ProvisionError::ReadRoot {
            path: root.to_path_buf(),
            source,
        };
        let mut repos = Vec::new();
        for entry in std::fs::read_dir(root).map_err(read_root)? {
            let entry = entry.map_err(read_root)?;
            if entry.file_type().map_err(read_root)?.is_dir() {
                repos.push(entry.path());
            }
        }
        repos.sort();

        for repo in &repos {
            self.write_hooks(repo)?;
        }
        info!(
            repos = repos.len(),
            executable = %self.executable.display(),
            "hooks provisioned"
        );
        Ok(repos.len())
    }

    /// Provision a single repository directory.
    pub fn provision_repo(&self, repo_dir: &Path) -> Result<(), ProvisionError> {
        let _guard = PROVISION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_hooks(repo_dir)
    }

    fn write_hooks(&self, repo_dir: &Path) -> Result<(), ProvisionError> {
        let hooks_dir = repo_dir.join("hooks");
        std::fs::create_dir_all(&hooks_dir).map_err(|source| {
            ProvisionError::CreateHooksDir {
                path: hooks_dir.clone(),
                source,
            }
        })?;

        for hook in HookName::ALL {
            let path = hooks_dir.join(hook.as_str());
            write_executable(&hooks_dir, &path, self.render(hook).as_bytes())
                .map_err(|source| ProvisionError::WriteHook { path, source })?;
        }
        debug!(repo = %repo_dir.display(), "hooks written");
        Ok(())
    }
}

/// Replace `path` with `contents` in one rename.
fn write_executable(dir: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(HOOK_MODE))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_repo(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("hooks")).unwrap();
        dir
    }

    #[test]
    fn update_script_forwards_positional_args() {
        let p = HookProvisioner::new("/usr/local/bin/githarbor", "Git Harbor");
        let script = p.render(HookName::Update);
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains("AUTO GENERATED BY GIT HARBOR"));
        assert!(script.contains(r#"'/usr/local/bin/githarbor' internal hook update "$1" "$2" "$3""#));
    }

    #[test]
    fn batch_scripts_take_no_args() {
        let p = HookProvisioner::new("/bin/gh", "x");
        for hook in [HookName::PreReceive, HookName::PostReceive] {
            let script = p.render(hook);
            let last = script.lines().last().unwrap();
            assert_eq!(last, format!("exec '/bin/gh' internal hook {hook}"));
        }
    }

    #[test]
    fn quotes_paths_with_spaces_and_quotes() {
        assert_eq!(shell_quote("/opt/my app/gh"), "'/opt/my app/gh'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn provisions_every_repo_with_executable_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let a = make_repo(tmp.path(), "a.git");
        let b = tmp.path().join("b.git");
        std::fs::create_dir_all(&b).unwrap(); // no hooks dir yet
        std::fs::write(tmp.path().join("README"), "not a repo").unwrap();

        let p = HookProvisioner::new("/bin/gh", "x");
        assert_eq!(p.provision(tmp.path()).unwrap(), 2);

        for repo in [&a, &b] {
            for hook in HookName::ALL {
                let path = repo.join("hooks").join(hook.as_str());
                let mode = std::fs::metadata(&path).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o755, "{}", path.display());
                assert_eq!(std::fs::read_to_string(&path).unwrap(), p.render(hook));
            }
        }
    }

    #[test]
    fn reprovisioning_overwrites_stale_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = make_repo(tmp.path(), "a.git");
        let hook = repo.join("hooks").join("pre-receive");
        std::fs::write(&hook, "#!/bin/sh\n/old/path/githarbor internal hook pre-receive\n# extra trailing junk\n")
            .unwrap();

        HookProvisioner::new("/old/path/githarbor", "x")
            .provision(tmp.path())
            .unwrap();
        HookProvisioner::new("/new/path/githarbor", "x")
            .provision(tmp.path())
            .unwrap();

        let script = std::fs::read_to_string(&hook).unwrap();
        assert!(script.contains("/new/path/githarbor"));
        assert!(!script.contains("/old/path"));
        assert!(!script.contains("junk"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let p = HookProvisioner::new("/bin/gh", "x");
        let err = p
            .provision(Path::new("/tmp/nonexistent_githarbor_provision_root"))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ReadRoot { .. }));
    }

    #[test]
    fn write_failure_aborts_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        make_repo(tmp.path(), "a.git");
        // A regular file where the hooks directory should be.
        let broken = tmp.path().join("b.git");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("hooks"), "not a dir").unwrap();

        let p = HookProvisioner::new("/bin/gh", "x");
        let err = p.provision(tmp.path()).unwrap_err();
        assert!(matches!(err, ProvisionError::CreateHooksDir { .. }));
    }

    #[test]
    fn control_characters_in_name_stay_in_the_comment() {
        let p = HookProvisioner::new("/bin/gh", "harbor\nrm -rf /\r");
        let script = p.render(HookName::PreReceive);
        assert_eq!(script.lines().count(), 3, "{script}");
        assert!(script.contains("# AUTO GENERATED BY HARBORRM -RF /, DO NOT MODIFY\n"));
    }

    #[test]
    fn concurrent_runs_never_interleave_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let repos: Vec<_> = (0..4).map(|i| make_repo(tmp.path(), &format!("r{i}.git"))).collect();
        let provisioners: Vec<_> = (0..8)
            .map(|i| HookProvisioner::new(format!("/opt/githarbor-{i}/bin/githarbor"), "x"))
            .collect();

        std::thread::scope(|scope| {
            for p in &provisioners {
                let root = tmp.path();
                scope.spawn(move || {
                    for _ in 0..5 {
                        p.provision(root).unwrap();
                        p.provision_repo(&root.join("r0.git")).unwrap();
                    }
                });
            }
        });

        for repo in &repos {
            for hook in HookName::ALL {
                let path = repo.join("hooks").join(hook.as_str());
                let script = std::fs::read_to_string(&path).unwrap();
                assert!(
                    provisioners.iter().any(|p| p.render(hook) == script),
                    "{} is not a complete script:\n{script}",
                    path.display()
                );
                let mode = std::fs::metadata(&path).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o755, "{}", path.display());
            }
            // No temp files left behind.
            let entries = std::fs::read_dir(repo.join("hooks")).unwrap().count();
            assert_eq!(entries, HookName::ALL.len());
        }
    }
}
