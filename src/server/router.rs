//! Server setup and routing.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use tower_http::trace::TraceLayer;

use crate::cache::Cache;
use crate::cache::RedisCache;
use crate::catalog::Catalog;
use crate::catalog::FileCatalog;
use crate::config::Config;
use crate::engine::EngineRouter;
use crate::events::EventSink;
use crate::events::RedisEventSink;
use crate::jobs::JobStore;
use crate::provision::DockerLauncher;
use crate::provision::Launcher;
use crate::provision::Provisioner;

use super::api::AppState;
use super::api::docker::current_workspace;
use super::api::docker::next_challenge;
use super::api::docker::start_workspace;
use super::api::docker::terminate_workspace;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/docker",
            post(start_workspace)
                .get(current_workspace)
                .delete(terminate_workspace),
        )
        .route("/docker/next", get(next_challenge))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server.
///
/// # Errors
///
/// Returns an error if a backing service is unreachable or the server
/// fails to bind.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let cache: Arc<dyn Cache> = Arc::new(RedisCache::connect(&config.cache.redis_url).await?);
    let jobs = JobStore::new(
        cache.clone(),
        config.cache.job_prefix.clone(),
        Duration::from_secs(config.cache.job_ttl),
    );
    let catalog: Arc<dyn Catalog> = Arc::new(FileCatalog::from_file(&config.catalog.path)?);
    let launcher: Arc<dyn Launcher> = Arc::new(DockerLauncher::new(
        EngineRouter::new(&config.engine),
        cache.clone(),
        config.clone(),
    ));
    let events: Arc<dyn EventSink> =
        Arc::new(RedisEventSink::connect(&config.cache.redis_url).await?);

    let provisioner = Provisioner::new(
        jobs.clone(),
        catalog.clone(),
        launcher.clone(),
        events.clone(),
        config.clone(),
    );

    let state = AppState {
        config: config.clone(),
        cache,
        jobs,
        catalog,
        launcher,
        provisioner,
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on `{}`", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
