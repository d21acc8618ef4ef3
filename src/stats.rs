//! Stats listener: Prometheus metrics on `GET /metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::http::{serve_router, AppError};
use crate::lifecycle::{Listener, ListenerControl, ListenerError, ListenerKind};
use crate::metrics::MetricsRegistry;
use crate::AppState;

pub fn create_router(metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(metrics)
}

/// `GET /metrics`
async fn handle_metrics(State(metrics): State<MetricsRegistry>) -> Result<Response, AppError> {
    let body = metrics.encode()?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

pub struct StatsListener {
    state: Arc<AppState>,
    control: ListenerControl,
}

impl StatsListener {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            control: ListenerControl::new(),
        }
    }
}

#[async_trait::async_trait]
impl Listener for StatsListener {
    fn kind(&self) -> ListenerKind {
        ListenerKind::Stats
    }

    fn control(&self) -> &ListenerControl {
        &self.control
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let router = create_router(self.state.metrics.clone());
        serve_router(
            ListenerKind::Stats,
            &self.state.config.stats.listen_addr,
            router,
            &self.control,
        )
        .await
    }
}
