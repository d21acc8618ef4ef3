use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::git::GitService;
use crate::lifecycle::{ListenerKind, ShutdownOutcome};

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ListenerLabels {
    pub listener: ListenerKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GitLabels {
    pub listener: ListenerKind,
    pub service: GitService,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CommandOutcome {
    Ok,
    Unauthorized,
    NotFound,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: String,
    pub outcome: CommandOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ShutdownLabels {
    pub listener: ListenerKind,
    pub outcome: ShutdownOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed on the stats listener.
pub struct Metrics {
    pub session_commands: Family<CommandLabels, Counter>,
    pub git_requests: Family<GitLabels, Counter>,
    pub access_denied: Family<ListenerLabels, Counter>,
    pub active_connections: Family<ListenerLabels, Gauge>,
    pub listener_shutdowns: Family<ShutdownLabels, Counter>,
    pub repos_created: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let session_commands = Family::<CommandLabels, Counter>::default();
        registry.register(
            "githarbor_session_commands",
            "SSH session commands by command and outcome",
            session_commands.clone(),
        );

        let git_requests = Family::<GitLabels, Counter>::default();
        registry.register(
            "githarbor_git_requests",
            "Git transport requests by listener and service",
            git_requests.clone(),
        );

        let access_denied = Family::<ListenerLabels, Counter>::default();
        registry.register(
            "githarbor_access_denied",
            "Requests refused by access control",
            access_denied.clone(),
        );

        let active_connections = Family::<ListenerLabels, Gauge>::default();
        registry.register(
            "githarbor_active_connections",
            "Currently active connections by listener",
            active_connections.clone(),
        );

        let listener_shutdowns = Family::<ShutdownLabels, Counter>::default();
        registry.register(
            "githarbor_listener_shutdowns",
            "Listener shutdowns by outcome",
            listener_shutdowns.clone(),
        );

        let repos_created = Counter::default();
        registry.register(
            "githarbor_repos_created",
            "Repositories created on first push",
            repos_created.clone(),
        );

        Self {
            session_commands,
            git_requests,
            access_denied,
            active_connections,
            listener_shutdowns,
            repos_created,
        }
    }

    /// Count a connection on `listener` as active until the guard drops.
    pub fn connection(&self, listener: ListenerKind) -> ConnectionGuard {
        let gauge = self
            .active_connections
            .get_or_create(&ListenerLabels { listener })
            .clone();
        gauge.inc();
        ConnectionGuard { gauge }
    }

    pub fn denied(&self, listener: ListenerKind) {
        self.access_denied
            .get_or_create(&ListenerLabels { listener })
            .inc();
    }

    pub fn git_request(&self, listener: ListenerKind, service: GitService) {
        self.git_requests
            .get_or_create(&GitLabels { listener, service })
            .inc();
    }
}

pub struct ConnectionGuard {
    gauge: Gauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all server metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_tracks_active_connections() {
        let m = MetricsRegistry::new();
        let labels = ListenerLabels {
            listener: ListenerKind::Ssh,
        };
        {
            let _a = m.metrics.connection(ListenerKind::Ssh);
            let _b = m.metrics.connection(ListenerKind::Ssh);
            assert_eq!(m.metrics.active_connections.get_or_create(&labels).get(), 2);
        }
        assert_eq!(m.metrics.active_connections.get_or_create(&labels).get(), 0);
    }

    #[test]
    fn encodes_registered_metrics() {
        let m = MetricsRegistry::new();
        m.metrics.denied(ListenerKind::Http);
        let text = m.encode().unwrap();
        assert!(text.contains("githarbor_access_denied_total{listener=\"Http\"} 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
