//! SSH host key bootstrap.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tracing::info;

/// Load the host key at `path`, generating and writing an Ed25519 key there
/// first if the file does not exist.
pub fn load_or_create_host_key(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create key directory: {}", dir.display()))?;
        }
        let key = KeyPair::generate_ed25519();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to create host key file: {}", path.display()))?;
        russh_keys::encode_pkcs8_pem(&key, file)
            .with_context(|| format!("failed to write host key: {}", path.display()))?;
        info!(path = %path.display(), "generated SSH host key");
    }

    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load SSH host key: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Identity;

    #[test]
    fn generates_once_then_reloads_same_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ssh").join("host_ed25519");

        let first = load_or_create_host_key(&path).unwrap();
        let pem = std::fs::read(&path).unwrap();
        let second = load_or_create_host_key(&path).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), pem);
        let fp = |k: &KeyPair| Identity::from_public_key(&k.clone_public_key().unwrap());
        assert_eq!(fp(&first), fp(&second));
    }

    #[test]
    fn garbage_key_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("host_ed25519");
        std::fs::write(&path, "not a key").unwrap();
        assert!(load_or_create_host_key(&path).is_err());
    }
}
