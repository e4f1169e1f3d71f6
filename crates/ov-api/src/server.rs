//! HTTP API Server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use http::HeaderValue;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ov_core::ApiConfig;
use ov_supervisor::ControlPlane;

use crate::routes::routes;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(plane: Arc<ControlPlane>, api_key: Option<String>) -> Self {
        Self {
            plane,
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

fn cors(allowed_origins: Option<&[String]>) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .unwrap_or_default()
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    }
}

/// Build the application router
pub fn app(state: AppState, allowed_origins: Option<&[String]>) -> Router {
    Router::new()
        .merge(routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors(allowed_origins))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn start_server(
    config: &ApiConfig,
    plane: Arc<ControlPlane>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if config.key.is_none() {
        warn!("API_KEY not set, /api endpoints are unauthenticated");
    }
    let state = AppState::new(plane, config.key.clone());
    let app = app(state, config.allowed_origins.as_deref());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("HTTP API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}
