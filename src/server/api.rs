//! API state, authentication, and handlers.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;

use crate::cache::Cache;
use crate::catalog::Catalog;
use crate::catalog::User;
use crate::config::Config;
use crate::jobs::JobStore;
use crate::provision::Launcher;
use crate::provision::Provisioner;

pub mod docker;
pub mod error;
pub mod models;

use error::Error;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Arc<Config>,
    /// Shared cache (locks, device memo, running-image hints).
    pub cache: Arc<dyn Cache>,
    /// Job store.
    pub jobs: JobStore,
    /// Challenge metadata.
    pub catalog: Arc<dyn Catalog>,
    /// Workspace launcher.
    pub launcher: Arc<dyn Launcher>,
    /// Provisioning worker factory.
    pub provisioner: Provisioner,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// The authenticated user of a request.
///
/// Session handling itself is external; the API accepts a bearer token
/// and resolves it through the catalog.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub User);

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        let Some(token) = token else {
            return Err(Error::Unauthorized(String::from("Missing session token")));
        };

        match state.catalog.session_user(token).await {
            Ok(Some(user)) => Ok(Self(user)),
            Ok(None) => Err(Error::Unauthorized(String::from("Invalid session token"))),
            Err(e) => {
                tracing::error!("failed to resolve session: {e:#}");
                Err(Error::Unavailable)
            }
        }
    }
}
