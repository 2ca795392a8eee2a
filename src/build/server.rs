use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::orchestrator::JobOrchestrator;
use super::store::{InMemoryJobStore, SharedJobStore};
use crate::buildbox_config::BuildboxConfig;

/// Configuration for the build server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    /// Open the health endpoint in a browser once listening.
    pub open_browser: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
            open_browser: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &BuildboxConfig) -> Self {
        Self {
            host: config.host().to_string(),
            port: config.port(),
            dev_mode: config.dev_mode(),
            open_browser: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the build server and run until Ctrl-C.
pub async fn start_server(server: ServerConfig, config: &BuildboxConfig) -> Result<()> {
    for dir in [config.workspace_root(), config.artifact_root(), config.log_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let orchestrator = JobOrchestrator::from_config(config, store);
    let state = Arc::new(AppState { orchestrator });
    let app = build_router(state, server.dev_mode);

    let host = if server.dev_mode { "0.0.0.0" } else { server.host.as_str() };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, dev_mode = server.dev_mode, "build server listening");
    println!("buildbox server running at http://{}", local_addr);

    if server.open_browser {
        let url = format!("http://{}/health", local_addr);
        if let Err(e) = open::that(&url) {
            tracing::warn!(url = %url, error = %e, "failed to open browser");
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::materializer::ProjectMaterializer;
    use crate::build::packager::ArtifactPackager;
    use crate::build::runner::BuildRunner;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router(dev_mode: bool) -> Router {
        let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
        let orchestrator = JobOrchestrator::new(
            Arc::clone(&store),
            ProjectMaterializer::new("/tmp/none/template", "/tmp/none/ws", "/tmp/none/sel", "dist"),
            BuildRunner::new(vec!["true".into()], "/tmp/none/logs", store),
            ArtifactPackager::new(),
            "/tmp/none/artifacts",
        );
        build_router(Arc::new(AppState { orchestrator }), dev_mode)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/api/builds")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let app = test_router(true);
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.dev_mode);
    }
}
