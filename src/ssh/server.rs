//! SSH accept loop and the russh server configuration.

use std::sync::Arc;
use std::time::Duration;

use russh::server;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::{debug, info, warn};

use super::session::SshSession;
use crate::lifecycle::{bind, Listener, ListenerControl, ListenerError, ListenerKind};
use crate::AppState;

/// The SSH [`Listener`].  Each accepted connection runs as its own session
/// task tracked by the listener's [`ListenerControl`].
pub struct SshListener {
    state: Arc<AppState>,
    config: Arc<server::Config>,
    control: ListenerControl,
}

impl SshListener {
    pub fn new(state: Arc<AppState>, host_key: KeyPair) -> Self {
        let ssh = &state.config.ssh;
        let config = Arc::new(server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            preferred: russh::Preferred::DEFAULT,
            inactivity_timeout: Some(Duration::from_secs(ssh.idle_timeout)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: ssh.max_auth_attempts,
            ..Default::default()
        });
        Self {
            state,
            config,
            control: ListenerControl::new(),
        }
    }
}

#[async_trait::async_trait]
impl Listener for SshListener {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Ssh
    }

    fn control(&self) -> &ListenerControl {
        &self.control
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let listener = bind(ListenerKind::Ssh, &self.state.config.ssh.listen_addr).await?;
        let Some(_running) = self.control.begin() else {
            return Ok(());
        };

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = self.control.graceful().cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "SSH accept failed");
                        continue;
                    }
                },
            };
            info!(peer = %peer_addr, "new SSH client connection");

            let handler = SshSession::new(Arc::clone(&self.state), Some(peer_addr));
            let config = Arc::clone(&self.config);
            let connection = self.state.metrics.metrics.connection(ListenerKind::Ssh);
            self.control.spawn(async move {
                let _connection = connection;
                let result = match server::run_stream(config, stream, handler).await {
                    Ok(session) => session.await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!(peer = %peer_addr, error = %e, "SSH session ended with error");
                }
            });
        }

        debug!("SSH listener stopped accepting");
        Ok(())
    }
}
