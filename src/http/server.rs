//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the status handlers
//! - Wire up middleware (tracing, timeout, request ID, lifecycle gate)
//! - Serve on the listener bound by bootstrap
//! - Stop accepting on cancellation and drain in-flight requests

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use async_trait::async_trait;

use crate::http::middleware::lifecycle_gate;
use crate::lifecycle::state::{Lifecycle, LifecycleState, PendingUpdate};
use crate::lifecycle::worker::{Worker, WorkerError};
use crate::messenger::MessengerRegistry;
use crate::services::campaign::{CampaignCounters, CampaignStats};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Lifecycle,
    pub messengers: Arc<MessengerRegistry>,
    pub campaigns: Arc<CampaignStats>,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
struct Health {
    status: LifecycleState,
}

#[derive(Debug, Serialize)]
struct About {
    version: &'static str,
    state: LifecycleState,
    update: Option<PendingUpdate>,
    messengers: Vec<String>,
    campaigns: CampaignCounters,
}

/// HTTP server, run as a [`Worker`].
pub struct HttpServer {
    router: Router,
    listener: Mutex<Option<TcpListener>>,
}

impl HttpServer {
    /// Create a server that will serve on `listener`.
    pub fn new(listener: TcpListener, state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(state: AppState) -> Router {
        let api = Router::new()
            .route("/about", get(about_handler))
            .route_layer(middleware::from_fn_with_state(state.clone(), lifecycle_gate));

        Router::new()
            .route("/health", get(health_handler))
            .nest("/api", api)
            .with_state(state)
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }
}

#[async_trait]
impl Worker for HttpServer {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| WorkerError::Failed("HTTP server already ran".to_string()))?;

        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        // Serve with graceful shutdown
        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.lifecycle.state();
    let code = if status == LifecycleState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(Health { status }))
}

async fn about_handler(State(state): State<AppState>) -> Json<About> {
    let (status, update) = state.lifecycle.snapshot();
    Json(About {
        version: state.version,
        state: status,
        update,
        messengers: state.messengers.names(),
        campaigns: state.campaigns.snapshot(),
    })
}
