//! Repository lifecycle hooks.
//!
//! Every repository gets three generated scripts (`pre-receive`, `update`,
//! `post-receive`) that re-invoke this binary as `internal hook <name>`.  The
//! scripts are written by [`provision`]; the re-invoked process runs
//! [`dispatch`].
//!
//! Git's ordering contract for a push:
//! - `pre-receive` fires once, before any ref is written, with the whole batch
//!   on stdin
//! - `update` fires once per ref while writing, with `<ref> <old> <new>` as
//!   arguments
//! - `post-receive` fires once after every ref is written, batch on stdin

pub mod dispatch;
pub mod provision;

use std::fmt;
use std::io::BufRead;

use anyhow::{bail, Context, Result};

/// The hooks this server installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum HookName {
    PreReceive,
    Update,
    PostReceive,
}

impl HookName {
    pub const ALL: [HookName; 3] = [HookName::PreReceive, HookName::Update, HookName::PostReceive];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::PreReceive => "pre-receive",
            HookName::Update => "update",
            HookName::PostReceive => "post-receive",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ref updates
// ---------------------------------------------------------------------------

/// One branch or tag move: `<old-id> <new-id> <ref-name>`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub refname: String,
}

impl RefUpdate {
    pub fn new(old: impl Into<String>, new: impl Into<String>, refname: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
            refname: refname.into(),
        }
    }

    /// Parse a `pre-receive` / `post-receive` stdin line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(old), Some(new), Some(refname), None) => Ok(Self::new(old, new, refname)),
            _ => bail!("malformed ref update line: {line:?}"),
        }
    }

    /// Build from the `update` hook's positional arguments (`<ref> <old> <new>`).
    pub fn from_update_args(args: &[String]) -> Result<Self> {
        match args {
            [refname, old, new] => Ok(Self::new(old, new, refname)),
            _ => bail!("update hook expects exactly 3 arguments, got {}", args.len()),
        }
    }

    /// Reject anything git itself would never send.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.refname.starts_with("refs/") && self.refname.len() > "refs/".len(),
            "invalid ref name: {:?}",
            self.refname
        );
        anyhow::ensure!(is_object_id(&self.old), "invalid old object id: {:?}", self.old);
        anyhow::ensure!(is_object_id(&self.new), "invalid new object id: {:?}", self.new);
        Ok(())
    }

    pub fn is_create(&self) -> bool {
        is_null_id(&self.old)
    }

    pub fn is_delete(&self) -> bool {
        is_null_id(&self.new)
    }
}

/// SHA-1 (40) or SHA-256 (64) hex object id.
fn is_object_id(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_null_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b == b'0')
}

/// Read ref-update records until end of input.  Blank lines are skipped.
pub fn read_ref_updates<R: BufRead>(reader: R) -> Result<Vec<RefUpdate>> {
    let mut updates = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read ref updates")?;
        if line.trim().is_empty() {
            continue;
        }
        updates.push(RefUpdate::parse_line(&line)?);
    }
    Ok(updates)
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of a hook: accept, or reject with a reason for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDecision {
    pub allowed: bool,
    pub message: String,
}

impl HookDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: String::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
        }
    }

    /// Process exit status git acts on.
    pub fn exit_code(&self) -> i32 {
        if self.allowed {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const ZERO: &str = "0000000000000000000000000000000000000000";
    pub const TIP: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

    #[test]
    fn hook_names_match_git() {
        let names: Vec<_> = HookName::ALL.iter().map(HookName::as_str).collect();
        assert_eq!(names, ["pre-receive", "update", "post-receive"]);
    }

    #[test]
    fn reads_batch_until_eof() {
        let input = format!("{ZERO} {TIP} refs/heads/main\n\n{TIP} {ZERO} refs/tags/v1\n");
        let updates = read_ref_updates(input.as_bytes()).unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[0].is_create());
        assert!(updates[1].is_delete());
        assert_eq!(updates[1].refname, "refs/tags/v1");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(RefUpdate::parse_line("only two").is_err());
        assert!(RefUpdate::parse_line("a b c d").is_err());
    }

    #[test]
    fn update_args_are_ref_old_new() {
        let args = vec!["refs/heads/main".to_string(), ZERO.to_string(), TIP.to_string()];
        let update = RefUpdate::from_update_args(&args).unwrap();
        assert_eq!(update, RefUpdate::new(ZERO, TIP, "refs/heads/main"));
        assert!(update.validate().is_ok());
        assert!(RefUpdate::from_update_args(&args[..2]).is_err());
    }

    #[test]
    fn validate_checks_ids_and_ref() {
        assert!(RefUpdate::new(ZERO, "xyz", "refs/heads/main").validate().is_err());
        assert!(RefUpdate::new(ZERO, TIP, "main").validate().is_err());
        assert!(RefUpdate::new(ZERO, TIP, "refs/").validate().is_err());
        let sha256 = "a".repeat(64);
        assert!(RefUpdate::new(ZERO, &sha256, "refs/heads/x").validate().is_ok());
    }
}
