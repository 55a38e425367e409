use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod breaker;
mod config;
mod error;
mod events;
mod handlers;
mod metrics;
mod registry;
mod store;
mod stream;
#[cfg(test)]
mod test_helpers;

use crate::breaker::CircuitBreaker;
use crate::config::{DataDir, EngineConfig, FileConfig, load_config};
use crate::metrics::EngineMetrics;
use crate::registry::SessionRegistry;
use crate::store::{PersistHandle, SqliteStore};
use crate::stream::StreamManager;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "termhub")]
#[command(about = "Terminal session orchestration and focus-based streaming server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.termhub)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Server(ServerArgs),
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the HTTP server (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub streams: Arc<StreamManager>,
    pub metrics: Arc<EngineMetrics>,
    pub persist: PersistHandle,
    pub store: Option<Arc<SqliteStore>>,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        // Session routes
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/focus", put(handlers::set_focus))
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}", delete(handlers::delete_session))
        .route("/api/sessions/{id}/stream", get(handlers::stream_handler))
        // Project-scoped lifecycle
        .route(
            "/api/projects/{project_id}/suspend",
            post(handlers::suspend_project),
        )
        .route(
            "/api/projects/{project_id}/resume",
            post(handlers::resume_project),
        )
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = DataDir::new(cli.data_dir.clone())?;

    match cli.command {
        Some(Commands::Server(args)) => run_server(args, data_dir).await,
        None => run_server(ServerArgs::default(), data_dir).await,
    }
}

async fn run_server(args: ServerArgs, data_dir: DataDir) -> Result<()> {
    let default_directive = if args.debug {
        "termhub=debug,tower_http=debug,info"
    } else {
        "termhub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting termhub session engine");

    let file_config: FileConfig = load_config(&data_dir.root)
        .extract()
        .context("failed to load configuration")?;
    let engine_config = EngineConfig::from_file(&file_config);

    let events = events::create_event_bus();
    let breaker = Arc::new(CircuitBreaker::new(
        engine_config.breaker(&file_config.persistence),
        events.clone(),
    ));

    let store = if file_config.persistence.enabled {
        info!("session persistence enabled ({})", data_dir.db_url());
        Some(Arc::new(SqliteStore::connect(&data_dir.db_url()).await?))
    } else {
        info!("session persistence disabled");
        None
    };
    let persist = PersistHandle::new(store.clone(), breaker);

    let engine_metrics = Arc::new(EngineMetrics::new());
    metrics::spawn_collector(engine_metrics.clone(), &events);

    let registry = Arc::new(SessionRegistry::new(
        engine_config,
        events.clone(),
        persist.clone(),
    ));
    registry.spawn_reaper();
    metrics::spawn_resource_sampler(engine_metrics.clone(), &registry);

    let streams = StreamManager::new(registry.clone());
    streams.start();

    let app_state = AppState {
        registry: registry.clone(),
        streams,
        metrics: engine_metrics,
        persist,
        store,
    };

    let app = build_router(app_state);

    let host = args
        .host
        .or(file_config.server.host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(0);

    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("termhub listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/sessions                 - List sessions");
    info!("  POST   /api/sessions                 - Create session");
    info!("  PUT    /api/sessions/focus           - Change focus set");
    info!("  GET    /api/sessions/:id             - Session details");
    info!("  DELETE /api/sessions/:id             - Close session");
    info!("  GET    /api/sessions/:id/stream      - WebSocket stream");
    info!("  POST   /api/projects/:id/suspend     - Suspend project sessions");
    info!("  POST   /api/projects/:id/resume      - Resume project sessions");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    info!("Closing running sessions...");
    registry.close_all().await;
    info!("Shutdown complete");

    if let Err(e) = &server_result {
        warn!("server exited with error: {}", e);
    }
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_app_state;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_route_responds() {
        let app = build_router(test_app_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn create_session_route_round_trips() {
        let state = test_app_state().await;
        let registry = state.registry.clone();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sessions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"projectId":"proj-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["sessionId"].is_string());

        registry.close_all().await;
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = build_router(test_app_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
