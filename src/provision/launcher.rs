//! Docker-backed workspace launcher.
//!
//! Implements the [`Launcher`] seam against real engines: teardown of a
//! user's previous workspace, the start-to-ready pipeline, and label
//! inspection for the current workspace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::cache::Cache;
use crate::catalog::User;
use crate::config::Config;
use crate::engine::EngineRouter;
use crate::engine::container_name;

use super::LaunchSpec;
use super::LaunchedWorkspace;
use super::Launcher;
use super::builder;
use super::devices;
use super::material;
use super::readiness;

/// The cache key holding a user's most recently started image.
fn running_image_key(user_id: i64) -> String {
    format!("user_{user_id}-running-image")
}

/// Launcher backed by the container engine.
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    /// Engine resolution per user.
    router: EngineRouter,
    /// Shared cache for the device memo and running-image hint.
    cache: Arc<dyn Cache>,
    /// Service configuration.
    config: Arc<Config>,
}

impl DockerLauncher {
    /// Create a launcher over the given router and cache.
    pub fn new(router: EngineRouter, cache: Arc<dyn Cache>, config: Arc<Config>) -> Self {
        Self {
            router,
            cache,
            config,
        }
    }

    /// The last known image for a user's workspace, if cached.
    async fn image_hint(&self, user_id: i64) -> Option<String> {
        self.cache
            .get(&running_image_key(user_id))
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorkspace> {
        let engine = self
            .router
            .for_user(&spec.user, Some(&spec.challenge.image))?;
        let resolved = spec.challenge.resolve(&spec.dojo);
        let available = devices::available_devices(&engine, self.cache.as_ref()).await?;

        let start = Instant::now();
        let name = container_name(spec.user.id);
        let container_id =
            builder::start_workspace_container(&engine, &self.config, spec, &resolved, &available)
                .await?;
        info!(
            trace_id = %spec.trace_id,
            "container started after {:.1} seconds",
            start.elapsed().as_secs_f64()
        );

        readiness::await_initialized(engine.stream_logs(&name)).await?;
        info!(
            trace_id = %spec.trace_id,
            "workspace initialized after {:.1} seconds",
            start.elapsed().as_secs_f64()
        );

        // No expiry: the hint outlives any TTL so teardown can find a
        // workspace started in an earlier epoch.
        self.cache
            .put(&running_image_key(spec.user.id), &resolved.image, None)
            .await?;

        if let Some(path) = &spec.challenge.path {
            if path.exists() {
                material::install_challenge(
                    &engine,
                    &name,
                    &self.config.workspace.secret_key,
                    spec.as_user.id,
                    &spec.challenge,
                    path,
                )
                .await?;
            }
        }

        let flag = material::flag_value(
            &self.config.workspace.secret_key,
            spec.practice,
            spec.impersonating(),
            spec.as_user.id,
            spec.challenge.challenge_id,
        );
        material::insert_flag(&engine, &name, &flag).await?;

        readiness::await_ready(engine.stream_logs(&name)).await?;
        info!(
            trace_id = %spec.trace_id,
            "workspace ready after {:.1} seconds",
            start.elapsed().as_secs_f64()
        );

        Ok(LaunchedWorkspace { container_id })
    }

    async fn teardown(&self, user: &User) -> Result<()> {
        let hint = self.image_hint(user.id).await;
        let name = container_name(user.id);

        // A workspace may still be running on the engine that served an
        // earlier image; try the default resolution and the hint.
        for image in [None, hint.as_deref()] {
            let Ok(engine) = self.router.for_user(user, image) else {
                continue;
            };

            if engine.remove_container(&name).await.is_ok() {
                let _ = engine.wait_removed(&name).await;
            }
            for volume in [user.id.to_string(), format!("{}-overlay", user.id)] {
                let _ = engine.remove_volume(&volume).await;
            }
        }

        Ok(())
    }

    async fn current_labels(&self, user: &User) -> Result<Option<HashMap<String, String>>> {
        let hint = self.image_hint(user.id).await;
        let engine = self.router.for_user(user, hint.as_deref())?;
        engine.container_labels(&container_name(user.id)).await
    }
}
