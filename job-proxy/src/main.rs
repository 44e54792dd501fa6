//! The job proxy binary.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dojo_job_proxy::ProxyState;
use dojo_job_proxy::create_router;
use dojod::cache::RedisCache;
use dojod::jobs::JobStore;
use tracing_subscriber::EnvFilter;

/// Holding-page service for workspace start jobs.
#[derive(Parser, Debug)]
#[command(name = "dojo-job-proxy", version, about)]
struct Args {
    /// Host to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Redis URL of the shared job store.
    #[arg(long, env = "REDIS_URL", default_value = "redis://cache:6379/0")]
    redis_url: String,

    /// Key prefix of job records.
    #[arg(long, env = "DOCKER_JOB_PREFIX", default_value = "dojo:docker_job:")]
    job_prefix: String,

    /// Job record time-to-live, in seconds.
    #[arg(long, env = "DOCKER_JOB_TTL", default_value_t = 900)]
    job_ttl: u64,

    /// Holding-page refresh interval, in seconds.
    #[arg(long, env = "WORKSPACE_JOB_REFRESH", default_value_t = 3)]
    refresh: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cache = Arc::new(RedisCache::connect(&args.redis_url).await?);
    let jobs = JobStore::new(cache, args.job_prefix, Duration::from_secs(args.job_ttl));

    let app = create_router(ProxyState {
        jobs,
        refresh: args.refresh,
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("job proxy listening on `{}`", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
