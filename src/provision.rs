//! Workspace provisioning orchestration.
//!
//! A provisioning worker runs once per start request, independently of
//! the request that spawned it: it tears down the user's previous
//! workspace, launches a fresh one through [`Launcher`], signs the
//! handoff, and records the outcome on the job. Failures retry a fixed
//! number of times with a flat backoff; expected failures are transient
//! engine hiccups, not downstream saturation, and the user is parked on
//! a holding page in the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::catalog::Catalog;
use crate::catalog::Dojo;
use crate::catalog::DojoChallenge;
use crate::catalog::User;
use crate::config::Config;
use crate::events::ChallengeEvent;
use crate::events::EventSink;
use crate::jobs::Job;
use crate::jobs::JobState;
use crate::jobs::JobStore;
use crate::jobs::unix_now;

pub mod builder;
pub mod devices;
pub mod handoff;
pub mod launcher;
pub mod material;
pub mod readiness;

pub use launcher::DockerLauncher;

/// Maximum provisioning attempts per job.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// User-facing message after all attempts fail.
const START_FAILED_ERROR: &str = "Workspace failed to start. Please retry.";

/// User-facing message when the job's records vanished.
const REQUEST_INVALID_ERROR: &str = "Workspace request is no longer valid.";

/// A home-volume mount requested for a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeMount {
    /// In-container mount target.
    pub target: String,
    /// Volume name on the engine.
    pub volume: String,
    /// `homefs` driver options.
    pub options: HashMap<String, String>,
}

/// The home-volume mounts for a workspace.
///
/// Impersonation swaps the operator's home for an overlay of the
/// student's, keeping the operator's own home visible at `/home/me`.
pub fn home_mounts(user: &User, as_user: Option<&User>, trace_id: &str) -> Vec<HomeMount> {
    let trace = |mut options: HashMap<String, String>| {
        options.insert(String::from("trace_id"), trace_id.to_string());
        options
    };

    match as_user {
        None => vec![HomeMount {
            target: String::from("/home/hacker"),
            volume: user.id.to_string(),
            options: trace(HashMap::new()),
        }],
        Some(as_user) => vec![
            HomeMount {
                target: String::from("/home/hacker"),
                volume: format!("{}-overlay", user.id),
                options: trace(HashMap::from([(
                    String::from("overlay"),
                    as_user.id.to_string(),
                )])),
            },
            HomeMount {
                target: String::from("/home/me"),
                volume: user.id.to_string(),
                options: trace(HashMap::new()),
            },
        ],
    }
}

/// Everything a launcher needs to start one workspace.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The workspace owner (container identity, home volumes, routing).
    pub user: User,
    /// The effective user (flag, labels, handoff); equal to `user`
    /// outside impersonation.
    pub as_user: User,
    /// The dojo the challenge belongs to.
    pub dojo: Dojo,
    /// The challenge being started.
    pub challenge: DojoChallenge,
    /// Whether the workspace runs in practice mode.
    pub practice: bool,
    /// Home-volume mounts.
    pub mounts: Vec<HomeMount>,
    /// Trace id correlating engine and driver logs with the job.
    pub trace_id: String,
}

impl LaunchSpec {
    /// Whether this workspace is an impersonation session.
    pub fn impersonating(&self) -> bool {
        self.as_user.id != self.user.id
    }
}

/// A successfully launched workspace.
#[derive(Debug, Clone)]
pub struct LaunchedWorkspace {
    /// The engine-assigned container id.
    pub container_id: String,
}

/// The workspace launch seam.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a workspace and drive it to ready.
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorkspace>;

    /// Best-effort removal of the user's workspace and home volumes.
    async fn teardown(&self, user: &User) -> Result<()>;

    /// Labels of the user's current workspace container, if one exists.
    async fn current_labels(&self, user: &User) -> Result<Option<HashMap<String, String>>>;
}

/// Runs provisioning jobs to completion.
#[derive(Clone)]
pub struct Provisioner {
    /// Job store.
    jobs: JobStore,
    /// Challenge metadata.
    catalog: Arc<dyn Catalog>,
    /// Workspace launcher.
    launcher: Arc<dyn Launcher>,
    /// Feed event sink.
    events: Arc<dyn EventSink>,
    /// Service configuration.
    config: Arc<Config>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner").finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Create a provisioner over the given collaborators.
    pub fn new(
        jobs: JobStore,
        catalog: Arc<dyn Catalog>,
        launcher: Arc<dyn Launcher>,
        events: Arc<dyn EventSink>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            jobs,
            catalog,
            launcher,
            events,
            config,
        }
    }

    /// Run a provisioning job to completion.
    ///
    /// This is the worker entry point; it owns all writes to the job
    /// record after creation and never panics the caller: every failure
    /// is recorded on the job or logged.
    pub async fn run(&self, job_id: &str) {
        let job = match self
            .jobs
            .update(job_id, |job| job.state = JobState::Running)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("job `{job_id}` disappeared before it could start");
                return;
            }
            Err(e) => {
                warn!("failed to mark job `{job_id}` running: {e:#}");
                return;
            }
        };

        let records = self.load_records(&job).await;
        let Some((user, as_user, dojo, challenge)) = records else {
            self.finish_error(job_id, REQUEST_INVALID_ERROR).await;
            return;
        };

        let attempt_timeout = Duration::from_secs(self.config.workspace.attempt_timeout);
        for attempt in 1..=MAX_ATTEMPTS {
            info!(
                "starting workspace job `{job_id}` for user `{}` (attempt {attempt}/{MAX_ATTEMPTS})",
                user.id
            );

            let outcome = tokio::time::timeout(
                attempt_timeout,
                self.attempt(&job, &user, as_user.as_ref(), &dojo, &challenge),
            )
            .await;

            match outcome {
                Ok(Ok(workspace_url)) => {
                    let updated = self
                        .jobs
                        .update(job_id, |job| {
                            job.state = JobState::Ready;
                            job.workspace_url = Some(workspace_url.clone());
                            job.finished_at = Some(unix_now());
                        })
                        .await;
                    if let Err(e) = updated {
                        warn!("failed to mark job `{job_id}` ready: {e:#}");
                    }

                    self.publish_start(&job, &user, as_user.as_ref(), &dojo, &challenge)
                        .await;
                    return;
                }
                Ok(Err(e)) => {
                    warn!(
                        "attempt {attempt}/{MAX_ATTEMPTS} for job `{job_id}` (user `{}`) failed: {e:#}",
                        user.id
                    );
                }
                Err(_) => {
                    warn!(
                        "attempt {attempt}/{MAX_ATTEMPTS} for job `{job_id}` (user `{}`) timed out \
                         after {}s",
                        user.id,
                        attempt_timeout.as_secs()
                    );
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }

        self.finish_error(job_id, START_FAILED_ERROR).await;
        error!("workspace start failed for user `{}` (job `{job_id}`)", job.user_id);
    }

    /// Load the user, impersonation target, dojo, and challenge records
    /// a job refers to.
    ///
    /// A missing impersonation target degrades to a normal start; a
    /// missing user or challenge invalidates the job.
    async fn load_records(&self, job: &Job) -> Option<(User, Option<User>, Dojo, DojoChallenge)> {
        let user = match self.catalog.user(job.user_id).await {
            Ok(user) => user?,
            Err(e) => {
                warn!("failed to load user `{}` for job `{}`: {e:#}", job.user_id, job.id);
                return None;
            }
        };

        let as_user = match job.as_user_id {
            Some(id) => self.catalog.user(id).await.ok().flatten(),
            None => None,
        };

        let dojo = match self.catalog.dojo(&job.dojo_reference).await {
            Ok(dojo) => dojo?,
            Err(e) => {
                warn!(
                    "failed to load dojo `{}` for job `{}`: {e:#}",
                    job.dojo_reference, job.id
                );
                return None;
            }
        };

        let challenge = match self
            .catalog
            .challenge(&dojo, job.module_id.as_deref(), &job.challenge_id)
            .await
        {
            Ok(challenge) => challenge?,
            Err(e) => {
                warn!(
                    "failed to load challenge `{}` for job `{}`: {e:#}",
                    job.challenge_id, job.id
                );
                return None;
            }
        };

        Some((user, as_user, dojo, challenge))
    }

    /// One provisioning attempt: teardown, launch, sign.
    async fn attempt(
        &self,
        job: &Job,
        user: &User,
        as_user: Option<&User>,
        dojo: &Dojo,
        challenge: &DojoChallenge,
    ) -> Result<String> {
        self.launcher.teardown(user).await?;

        let spec = LaunchSpec {
            user: user.clone(),
            as_user: as_user.cloned().unwrap_or_else(|| user.clone()),
            dojo: dojo.clone(),
            challenge: challenge.clone(),
            practice: job.practice,
            mounts: home_mounts(user, as_user, &job.id),
            trace_id: job.id.clone(),
        };

        let launched = self.launcher.launch(&spec).await?;
        handoff::workspace_url(&self.config.workspace, &spec.as_user, &launched.container_id)
    }

    /// Publish the container-start event for official and public dojos.
    async fn publish_start(
        &self,
        job: &Job,
        user: &User,
        as_user: Option<&User>,
        dojo: &Dojo,
        challenge: &DojoChallenge,
    ) {
        if !dojo.feed_visible() {
            return;
        }

        let event = ChallengeEvent {
            challenge_id: challenge.challenge_id,
            challenge_name: challenge.name.clone(),
            module_id: Some(challenge.module.id.clone()),
            module_name: Some(challenge.module.name.clone()),
            dojo_id: dojo.reference_id.clone(),
            dojo_name: dojo.name.clone(),
        };
        let mode = if job.practice { "practice" } else { "assessment" };
        let actual_user = as_user.unwrap_or(user);

        if let Err(e) = self
            .events
            .publish_container_start(actual_user, mode, &event)
            .await
        {
            warn!("failed to publish container start for job `{}`: {e:#}", job.id);
        }
    }

    /// Record a terminal error on the job.
    async fn finish_error(&self, job_id: &str, message: &str) {
        let updated = self
            .jobs
            .update(job_id, |job| {
                job.state = JobState::Error;
                job.error = Some(message.to_string());
                job.finished_at = Some(unix_now());
            })
            .await;
        if let Err(e) = updated {
            warn!("failed to mark job `{job_id}` as errored: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A user fixture.
    fn user(id: i64) -> User {
        User {
            id,
            name: format!("user{id}"),
            admin: false,
            node: None,
            awards: vec![],
        }
    }

    #[test]
    fn plain_start_mounts_the_home_volume() {
        let mounts = home_mounts(&user(7), None, "trace");
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, "/home/hacker");
        assert_eq!(mounts[0].volume, "7");
        assert_eq!(mounts[0].options.get("trace_id").unwrap(), "trace");
        assert!(!mounts[0].options.contains_key("overlay"));
    }

    #[test]
    fn impersonation_mounts_overlay_and_own_home() {
        let mounts = home_mounts(&user(7), Some(&user(9)), "trace");
        assert_eq!(mounts.len(), 2);

        assert_eq!(mounts[0].target, "/home/hacker");
        assert_eq!(mounts[0].volume, "7-overlay");
        assert_eq!(mounts[0].options.get("overlay").unwrap(), "9");
        assert_eq!(mounts[0].options.get("trace_id").unwrap(), "trace");

        assert_eq!(mounts[1].target, "/home/me");
        assert_eq!(mounts[1].volume, "7");
        assert!(!mounts[1].options.contains_key("overlay"));
    }
}
