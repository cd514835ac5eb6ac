//! HTTP report endpoint
//!
//! Read-only view of the agent's [`ReportSnapshot`]. Handlers copy out of the
//! snapshot and never touch the chain.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use prosumer_core::config::ReportSettings;
use prosumer_core::{MeterReading, MeterReport, ReportSnapshot};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{NodeError, Result};

/// Report server bound to one snapshot
pub struct ReportServer {
    snapshot: ReportSnapshot,
    addr: SocketAddr,
}

impl ReportServer {
    pub fn new(snapshot: ReportSnapshot, settings: &ReportSettings) -> Result<Self> {
        let raw = format!("{}:{}", settings.host, settings.port);
        let addr = raw
            .parse()
            .map_err(|_| NodeError::InvalidBindAddress(raw.clone()))?;
        Ok(Self { snapshot, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/reading", get(handle_reading))
            .route("/report", get(handle_report))
            .route("/health", get(handle_health))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.snapshot.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Report endpoint listening on http://{}", self.addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| NodeError::Server(e.to_string()))
    }
}

async fn handle_reading(State(snapshot): State<ReportSnapshot>) -> Json<MeterReading> {
    Json(snapshot.current_reading())
}

async fn handle_report(State(snapshot): State<ReportSnapshot>) -> Json<MeterReport> {
    Json(snapshot.report())
}

async fn handle_health(State(snapshot): State<ReportSnapshot>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "phase": snapshot.phase(),
        "version": crate::VERSION
    }))
}
