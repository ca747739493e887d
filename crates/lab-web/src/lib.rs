//! Lab Web Dashboard
//!
//! HTTP surface of the lab control plane: REST routes per stack and a
//! server-sent-event stream of each stack's push events.

pub mod routes;
pub mod sse;

use axum::Router;
use lab_adapters::{ClaudeEngine, ClaudeSettings, ComposeBackend};
use lab_core::{LabConfig, ServerConfig, StackContext, StackRegistry, StackSettings};
use lab_proto::AiEngine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Every managed stack by name
    pub stacks: Arc<StackRegistry>,
}

impl AppState {
    pub fn new(stacks: StackRegistry) -> Self {
        Self {
            stacks: Arc::new(stacks),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path to static files (frontend build output)
    pub static_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for Config {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            static_dir: server.static_dir.clone(),
        }
    }
}

/// Builds one stack context per configured stack, backed by Docker Compose
/// and the Claude CLI.
pub fn build_registry(config: &LabConfig) -> StackRegistry {
    let mut registry = StackRegistry::new();
    for stack in &config.stacks {
        let backend = Arc::new(ComposeBackend::from_config(stack));
        let engine: Arc<dyn AiEngine> = Arc::new(ClaudeEngine::new(ClaudeSettings::from_config(
            &config.diagnose,
            Some(stack.project_dir.clone()),
        )));
        registry.insert(StackContext::new(
            stack.name.clone(),
            backend,
            vec![engine],
            StackSettings::from_config(config, stack),
        ));
    }
    registry
}

/// Create the application router with provided state (for dependency injection)
pub fn create_app_with_state(config: &Config, state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new().merge(routes::api_routes(state)).layer(cors);

    // Add static file serving if configured
    if let Some(ref static_dir) = config.static_dir
        && static_dir.exists()
    {
        app = app.fallback_service(
            tower_http::services::ServeDir::new(static_dir).not_found_service(
                tower_http::services::ServeFile::new(static_dir.join("index.html")),
            ),
        );
    }

    app
}

/// Starts every stack's background work and serves until Ctrl-C.
pub async fn serve(config: Config, state: AppState) -> anyhow::Result<()> {
    state.stacks.start_all();

    let app = create_app_with_state(&config, state.clone());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down stacks");
    state.stacks.shutdown_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
