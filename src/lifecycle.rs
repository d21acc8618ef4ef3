//! Listener supervision and graceful shutdown.
//!
//! Every network listener implements [`Listener`] and owns a
//! [`ListenerControl`].  [`Server::run`] starts all of them concurrently and
//! waits for either the termination signal or the first listener failure,
//! then shuts every listener down against one shared deadline.  Work still
//! in flight at the deadline is force-closed; that is logged and counted but
//! never turned into a process failure.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelValue;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::metrics::{MetricsRegistry, ShutdownLabels};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ListenerKind {
    Ssh,
    Git,
    Http,
    Stats,
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ListenerKind::Ssh => "ssh",
            ListenerKind::Git => "git",
            ListenerKind::Http => "http",
            ListenerKind::Stats => "stats",
        })
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ShutdownOutcome {
    /// Everything in flight finished before the deadline.
    Graceful,
    /// The deadline elapsed and remaining work was dropped.
    Forced,
    /// The listener was never running.
    NotStarted,
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{kind} listener failed to bind {addr}")]
    Bind {
        kind: ListenerKind,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{kind} listener failed")]
    Serve {
        kind: ListenerKind,
        #[source]
        source: anyhow::Error,
    },
}

/// Bind a TCP listener for `kind` on `addr`.
pub async fn bind(kind: ListenerKind, addr: &str) -> Result<TcpListener, ListenerError> {
    let bind_err = |source| ListenerError::Bind {
        kind,
        addr: addr.to_string(),
        source,
    };
    let socket: SocketAddr = addr
        .parse()
        .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let listener = TcpListener::bind(socket).await.map_err(bind_err)?;
    info!(listener = %kind, address = %socket, "listening");
    Ok(listener)
}

// ---------------------------------------------------------------------------
// Per-listener control
// ---------------------------------------------------------------------------

/// Cancellation and in-flight tracking shared between a listener's serve
/// loop and its shutdown.
#[derive(Debug, Default)]
pub struct ListenerControl {
    graceful: CancellationToken,
    force: CancellationToken,
    stopped: CancellationToken,
    started: AtomicBool,
    tracker: TaskTracker,
}

impl ListenerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the listener as running.  The returned guard marks it stopped
    /// when dropped.  `None` means shutdown was already requested and the
    /// listener must not start serving.
    pub fn begin(&self) -> Option<DropGuard> {
        self.started.store(true, Ordering::SeqCst);
        let guard = self.stopped.clone().drop_guard();
        if self.graceful.is_cancelled() {
            return None;
        }
        Some(guard)
    }

    /// Cancelled once the listener should stop accepting.
    pub fn graceful(&self) -> &CancellationToken {
        &self.graceful
    }

    /// Cancelled once the shutdown deadline has elapsed.
    pub fn force(&self) -> &CancellationToken {
        &self.force
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Run one in-flight session.  It is awaited by graceful shutdown and
    /// dropped when the deadline forces the listener closed.
    pub fn spawn<F>(&self, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let force = self.force.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = force.cancelled() => debug!("in-flight session force-closed"),
                () = session => {}
            }
        });
    }

    /// Stop accepting, wait for the serve loop and every session until
    /// `deadline`, then force-close.  Safe to call repeatedly and on a
    /// listener that never started.
    pub async fn shutdown(&self, kind: ListenerKind, deadline: Instant) -> ShutdownOutcome {
        self.graceful.cancel();
        self.tracker.close();
        if !self.started.load(Ordering::SeqCst) {
            debug!(listener = %kind, "listener never started");
            return ShutdownOutcome::NotStarted;
        }

        let drained = async {
            self.stopped.cancelled().await;
            self.tracker.wait().await;
        };
        match tokio::time::timeout_at(deadline, drained).await {
            Ok(()) => ShutdownOutcome::Graceful,
            Err(_) => {
                warn!(
                    listener = %kind,
                    in_flight = self.tracker.len(),
                    "shutdown deadline elapsed, forcing close"
                );
                self.force.cancel();
                ShutdownOutcome::Forced
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    fn kind(&self) -> ListenerKind;

    fn control(&self) -> &ListenerControl;

    /// Bind and serve until stopped or failed.
    async fn start(&self) -> Result<(), ListenerError>;

    async fn shutdown(&self, deadline: Instant) -> ShutdownOutcome {
        self.control().shutdown(self.kind(), deadline).await
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Running,
    ShuttingDown,
    Stopped,
}

/// Supervisor for the listener set.
pub struct Server {
    listeners: Vec<Arc<dyn Listener>>,
    shutdown_timeout: Duration,
    metrics: MetricsRegistry,
    state: Mutex<ServerState>,
}

impl Server {
    pub fn new(
        listeners: Vec<Arc<dyn Listener>>,
        shutdown_timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            listeners,
            shutdown_timeout,
            metrics,
            state: Mutex::new(ServerState::NotStarted),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every listener, wait for `signal` or the first listener failure,
    /// then shut everything down.  Returns the failure, if there was one.
    pub async fn run<S>(&self, signal: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            anyhow::ensure!(
                *state == ServerState::NotStarted,
                "server cannot start from state {:?}",
                *state
            );
            *state = ServerState::Running;
        }

        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            let listener = Arc::clone(listener);
            let failed_tx = failed_tx.clone();
            handles.push(tokio::spawn(async move {
                match listener.start().await {
                    Ok(()) => debug!(listener = %listener.kind(), "listener stopped"),
                    Err(e) => {
                        error!(listener = %listener.kind(), error = %format!("{e:#}"), "listener failed");
                        let _ = failed_tx.send(e);
                    }
                }
            }));
        }
        drop(failed_tx);

        let failure = tokio::select! {
            () = signal => {
                info!("shutdown signal received");
                None
            }
            Some(e) = failed_rx.recv() => Some(e),
        };

        self.shutdown().await;
        for handle in handles {
            handle.abort();
        }

        match failure {
            Some(e) => Err(anyhow::Error::new(e)),
            None => Ok(()),
        }
    }

    /// Shut every listener down concurrently against one deadline.  Only
    /// the first call does anything; later calls return an empty list.
    pub async fn shutdown(&self) -> Vec<(ListenerKind, ShutdownOutcome)> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, ServerState::ShuttingDown | ServerState::Stopped) {
                debug!(state = ?*state, "shutdown already requested");
                return Vec::new();
            }
            *state = ServerState::ShuttingDown;
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        info!(timeout_secs = self.shutdown_timeout.as_secs_f64(), "shutting down listeners");

        let outcomes = futures::future::join_all(self.listeners.iter().map(|l| async move {
            (l.kind(), l.shutdown(deadline).await)
        }))
        .await;

        for (kind, outcome) in &outcomes {
            self.metrics
                .metrics
                .listener_shutdowns
                .get_or_create(&ShutdownLabels {
                    listener: *kind,
                    outcome: *outcome,
                })
                .inc();
            match outcome {
                ShutdownOutcome::Forced => warn!(listener = %kind, "listener force-closed"),
                _ => info!(listener = %kind, ?outcome, "listener closed"),
            }
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ServerState::Stopped;
        outcomes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Stops as soon as it is asked to.
        Prompt,
        /// Holds a session open that ignores the graceful signal.
        Slow,
        /// Fails right after starting.
        Fail,
    }

    struct FakeListener {
        kind: ListenerKind,
        behavior: Behavior,
        control: ListenerControl,
    }

    fn fake(kind: ListenerKind, behavior: Behavior) -> Arc<FakeListener> {
        Arc::new(FakeListener {
            kind,
            behavior,
            control: ListenerControl::new(),
        })
    }

    #[async_trait::async_trait]
    impl Listener for FakeListener {
        fn kind(&self) -> ListenerKind {
            self.kind
        }

        fn control(&self) -> &ListenerControl {
            &self.control
        }

        async fn start(&self) -> Result<(), ListenerError> {
            let Some(_running) = self.control.begin() else {
                return Ok(());
            };
            match self.behavior {
                Behavior::Fail => {
                    return Err(ListenerError::Serve {
                        kind: self.kind,
                        source: anyhow::anyhow!("boom"),
                    })
                }
                Behavior::Slow => self
                    .control
                    .spawn(tokio::time::sleep(Duration::from_secs(3600))),
                Behavior::Prompt => {}
            }
            self.control.graceful().cancelled().await;
            Ok(())
        }
    }

    fn server(listeners: Vec<Arc<FakeListener>>, timeout: Duration) -> Server {
        let listeners = listeners
            .into_iter()
            .map(|l| l as Arc<dyn Listener>)
            .collect();
        Server::new(listeners, timeout, MetricsRegistry::new())
    }

    #[tokio::test]
    async fn second_shutdown_is_a_no_op() {
        let a = fake(ListenerKind::Ssh, Behavior::Prompt);
        let srv = server(vec![a.clone()], Duration::from_secs(5));

        let first = srv.shutdown().await;
        assert_eq!(first, vec![(ListenerKind::Ssh, ShutdownOutcome::NotStarted)]);
        assert_eq!(srv.state(), ServerState::Stopped);
        assert!(srv.shutdown().await.is_empty());
        assert_eq!(srv.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn listener_that_never_started_cannot_start_later() {
        let a = fake(ListenerKind::Git, Behavior::Prompt);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            a.shutdown(deadline).await,
            ShutdownOutcome::NotStarted
        );
        a.start().await.unwrap();
        assert!(a.control.is_stopped());
        assert_eq!(a.shutdown(deadline).await, ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn slow_listener_is_forced_at_the_deadline() {
        let slow = fake(ListenerKind::Ssh, Behavior::Slow);
        let prompt = fake(ListenerKind::Http, Behavior::Prompt);
        let srv = Arc::new(server(
            vec![slow.clone(), prompt.clone()],
            Duration::from_millis(200),
        ));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn({
            let srv = Arc::clone(&srv);
            async move { srv.run(async { let _ = rx.await; }).await }
        });
        // Let both listeners reach their serve loop.
        while !(slow.control.started.load(Ordering::SeqCst)
            && prompt.control.started.load(Ordering::SeqCst))
        {
            tokio::task::yield_now().await;
        }

        let begun = Instant::now();
        tx.send(()).unwrap();
        run.await.unwrap().unwrap();
        let elapsed = begun.elapsed();

        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
        assert!(slow.control.force().is_cancelled());
        assert!(!prompt.control.force().is_cancelled());
        assert!(prompt.control.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), slow.control.tracker.wait())
            .await
            .expect("forced sessions are dropped");
    }

    #[tokio::test]
    async fn one_failing_listener_stops_all_of_them() {
        let bad = fake(ListenerKind::Stats, Behavior::Fail);
        let good = fake(ListenerKind::Ssh, Behavior::Prompt);
        let srv = server(vec![good.clone(), bad], Duration::from_secs(5));

        let err = srv.run(std::future::pending()).await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(good.control.graceful().is_cancelled());
        assert!(good.control.is_stopped() || !good.control.started.load(Ordering::SeqCst));
        assert_eq!(srv.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn run_twice_is_an_error() {
        let srv = server(vec![fake(ListenerKind::Git, Behavior::Prompt)], Duration::from_secs(1));
        srv.run(async {}).await.unwrap();
        assert!(srv.run(async {}).await.is_err());
    }

    #[tokio::test]
    async fn bind_reports_the_address() {
        let err = bind(ListenerKind::Http, "not-an-address").await.unwrap_err();
        assert!(err.to_string().contains("not-an-address"));
    }
}
