//! Holding-page service for workspace start jobs.
//!
//! A single public route serves the browser while a workspace start job
//! runs: it polls the job record in the shared cache and either holds
//! (auto-refreshing page), redirects to the ready workspace, or shows the
//! recorded error. The token in the path is the only credential.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]

use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::Html;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use dojod::jobs::JobState;
use dojod::jobs::JobStore;
use tower_http::trace::TraceLayer;
use tracing::error;

pub mod pages;

/// Proxy application state.
#[derive(Debug, Clone)]
pub struct ProxyState {
    /// Job store shared with the provisioning service.
    pub jobs: JobStore,
    /// Holding-page refresh interval, in seconds.
    pub refresh: u64,
}

/// Create the proxy router.
pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .route("/workspace/job/{id}/{token}", get(workspace_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the state of a workspace start job.
async fn workspace_job(
    State(state): State<ProxyState>,
    Path((job_id, token)): Path<(String, String)>,
) -> Response {
    let job = match state.jobs.get(&job_id).await {
        Ok(job) => job,
        Err(e) => {
            error!("failed to load job `{job_id}`: {e:#}");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "Unable to query workspace job",
            )
                .into_response();
        }
    };

    let Some(job) = job.filter(|job| job.token == token) else {
        return (StatusCode::NOT_FOUND, "Unknown workspace job").into_response();
    };

    let no_store = [(header::CACHE_CONTROL, "no-store")];

    if job.state == JobState::Ready {
        if let Some(url) = &job.workspace_url {
            return (
                StatusCode::FOUND,
                no_store,
                [(header::LOCATION, url.clone())],
            )
                .into_response();
        }
    }

    if job.state == JobState::Error {
        return (
            StatusCode::BAD_GATEWAY,
            no_store,
            Html(pages::error_page(&job)),
        )
            .into_response();
    }

    let refresh = state.refresh.max(1);
    (
        StatusCode::OK,
        no_store,
        Html(pages::wait_page(&job, refresh)),
    )
        .into_response()
}
