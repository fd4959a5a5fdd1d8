// Status listener
// Decision: /health reports 503 unless the relay is running, so orchestrators stop routing on drain
// Decision: /metrics serves the process registry in the Prometheus text format

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Registry;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use staterelay_core::RelayStatus;

/// State shared by the status routes
#[derive(Clone)]
pub struct StatusState {
    pub registry: Registry,
    pub hostname: String,
    pub workers: usize,
    pub status: watch::Receiver<RelayStatus>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: &'static str,
    hostname: String,
    workers: usize,
}

async fn health(State(state): State<StatusState>) -> impl IntoResponse {
    let status = *state.status.borrow();
    let code = if status == RelayStatus::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION"),
            hostname: state.hostname.clone(),
            workers: state.workers,
        }),
    )
}

async fn metrics(State(state): State<StatusState>) -> impl IntoResponse {
    match staterelay_core::metrics::gather(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Build the status router
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Running status listener
pub struct StatusServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StatusServer {
    /// Bind `addr` and serve the status routes in the background
    pub async fn start(addr: SocketAddr, state: StatusState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        info!(addr = %local_addr, "Status listener started");

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router(state))
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(e) = served {
                error!(error = %e, "Status listener failed");
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the listener to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Status listener task panicked");
        }
        info!("Status listener stopped");
    }
}
