//! SSH listener.
//!
//! Accepts public-key authenticated SSH connections.  `git-upload-pack`,
//! `git-receive-pack` and `git-upload-archive` exec requests are served by a
//! local git child process; every other exec request goes to the session
//! command router.

pub mod server;
pub mod session;

pub use server::SshListener;
