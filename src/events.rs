//! Container-start event publication.
//!
//! Successful starts in official or public dojos are announced on an
//! event feed. Publication is best-effort: failures are logged by the
//! caller and never affect the job outcome.

use std::fmt;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::catalog::User;

/// The Redis channel carrying feed events.
const FEED_CHANNEL: &str = "dojo:feed";

/// Challenge coordinates carried by a container-start event.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeEvent {
    /// Global numeric challenge id.
    pub challenge_id: i64,
    /// Challenge display name.
    pub challenge_name: String,
    /// Module id, if any.
    pub module_id: Option<String>,
    /// Module display name, if any.
    pub module_name: Option<String>,
    /// Dojo reference id.
    pub dojo_id: String,
    /// Dojo display name.
    pub dojo_name: String,
}

/// Sink for feed events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish a container-start event for the effective user.
    ///
    /// `mode` is `practice` or `assessment`.
    async fn publish_container_start(
        &self,
        user: &User,
        mode: &str,
        challenge: &ChallengeEvent,
    ) -> Result<()>;
}

/// Feed event payload as published.
#[derive(Debug, Serialize)]
struct ContainerStartEvent<'a> {
    /// The event type tag.
    event: &'static str,
    /// The effective user's id.
    user_id: i64,
    /// The effective user's name.
    user_name: &'a str,
    /// `practice` or `assessment`.
    mode: &'a str,
    /// Challenge coordinates.
    #[serde(flatten)]
    challenge: &'a ChallengeEvent,
}

/// Event sink publishing to a Redis channel.
#[derive(Clone)]
pub struct RedisEventSink {
    /// The managed connection.
    manager: redis::aio::ConnectionManager,
}

impl fmt::Debug for RedisEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventSink").finish_non_exhaustive()
    }
}

impl RedisEventSink {
    /// Connect to the feed at the given Redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn publish_container_start(
        &self,
        user: &User,
        mode: &str,
        challenge: &ChallengeEvent,
    ) -> Result<()> {
        let payload = serde_json::to_string(&ContainerStartEvent {
            event: "container_start",
            user_id: user.id,
            user_name: &user.name,
            mode,
            challenge,
        })
        .context("failed to serialize feed event")?;

        let mut con = self.manager.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(FEED_CHANNEL)
            .arg(payload)
            .query_async(&mut con)
            .await
            .context("failed to publish feed event")?;
        Ok(())
    }
}
