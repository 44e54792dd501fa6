//! Workspace start jobs and their shared-cache store.
//!
//! A job tracks one asynchronous workspace start. The record lives in the
//! shared cache under `{prefix}{id}` as a JSON object so that the job
//! proxy, a separate process, can observe it. Records are never deleted
//! explicitly; the TTL (refreshed on every write) garbage-collects
//! abandoned jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::Cache;
use crate::catalog::Dojo;
use crate::catalog::DojoChallenge;
use crate::catalog::User;

/// The state of a workspace start job.
///
/// Transitions are monotone: `pending → running → {ready | error}`, and
/// nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created, not yet picked up by a worker.
    Pending,
    /// A worker is provisioning the workspace.
    Running,
    /// The workspace is up; `workspace_url` is set.
    Ready,
    /// Provisioning failed; `error` is set.
    Error,
}

impl JobState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

/// A workspace start job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque job identifier (hex-encoded 128 bits).
    pub id: String,
    /// High-entropy token required for proxy reads.
    pub token: String,
    /// The requesting user's id.
    pub user_id: i64,
    /// The requesting user's name.
    pub user_name: String,
    /// The impersonated user's id, if any.
    pub as_user_id: Option<i64>,
    /// The impersonated user's name, if any.
    pub as_user_name: Option<String>,
    /// The dojo's numeric id.
    pub dojo_id: i64,
    /// The dojo's reference id.
    pub dojo_reference: String,
    /// The dojo's display name.
    pub dojo_name: String,
    /// The module id, if the challenge lives in a module.
    pub module_id: Option<String>,
    /// The module's display name, if any.
    pub module_name: Option<String>,
    /// The challenge id within the dojo.
    pub challenge_id: String,
    /// The challenge's display name.
    pub challenge_name: String,
    /// Whether the workspace runs in practice mode.
    pub practice: bool,
    /// Current state.
    pub state: JobState,
    /// Absolute workspace URL; set only in `ready`.
    pub workspace_url: Option<String>,
    /// Human-readable failure message; set only in `error`.
    pub error: Option<String>,
    /// Creation time, UNIX epoch seconds.
    pub created_at: i64,
    /// Last write time, UNIX epoch seconds.
    pub updated_at: i64,
    /// Completion time, UNIX epoch seconds; set in terminal states.
    pub finished_at: Option<i64>,
}

impl Job {
    /// Create a pending job for a workspace start request.
    pub fn new(
        user: &User,
        as_user: Option<&User>,
        dojo: &Dojo,
        challenge: &DojoChallenge,
        practice: bool,
    ) -> Self {
        let now = unix_now();
        Self {
            id: new_job_id(),
            token: new_job_token(),
            user_id: user.id,
            user_name: user.name.clone(),
            as_user_id: as_user.map(|u| u.id),
            as_user_name: as_user.map(|u| u.name.clone()),
            dojo_id: dojo.id,
            dojo_reference: dojo.reference_id.clone(),
            dojo_name: dojo.name.clone(),
            module_id: Some(challenge.module.id.clone()),
            module_name: Some(challenge.module.name.clone()),
            challenge_id: challenge.id.clone(),
            challenge_name: challenge.name.clone(),
            practice,
            state: JobState::Pending,
            workspace_url: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Generate a fresh job id.
fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a fresh job token (32 random bytes, URL-safe).
fn new_job_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current UNIX time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Job store over the shared cache.
#[derive(Debug, Clone)]
pub struct JobStore {
    /// The backing cache.
    cache: Arc<dyn Cache>,
    /// Key prefix for job records.
    prefix: String,
    /// Record time-to-live, refreshed on every write.
    ttl: Duration,
}

impl JobStore {
    /// Create a job store with the given key prefix and TTL.
    pub fn new(cache: Arc<dyn Cache>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
            ttl,
        }
    }

    /// The cache key of a job record.
    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Persist a job, refreshing `updated_at` and the TTL.
    pub async fn put(&self, job: &mut Job) -> Result<()> {
        job.updated_at = unix_now();
        let payload = serde_json::to_string(job).context("failed to serialize job")?;
        self.cache
            .put(&self.key(&job.id), &payload, Some(self.ttl))
            .await
    }

    /// Load a job, or `None` if absent or expired.
    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let payload = self.cache.get(&self.key(id)).await?;
        payload
            .map(|payload| serde_json::from_str(&payload).context("failed to deserialize job"))
            .transpose()
    }

    /// Read-modify-write a job.
    ///
    /// Returns the updated record, or `None` if the job no longer exists.
    /// Not atomic: after creation only the owning provisioning worker
    /// writes a given job, so there is no contention to guard against.
    pub async fn update(&self, id: &str, mutate: impl FnOnce(&mut Job)) -> Result<Option<Job>> {
        let Some(mut job) = self.get(id).await? else {
            return Ok(None);
        };
        mutate(&mut job);
        self.put(&mut job).await?;
        Ok(Some(job))
    }
}
