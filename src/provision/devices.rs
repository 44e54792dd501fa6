//! Detection of character devices available on an engine.
//!
//! Device availability is a property of the engine host and changes
//! rarely, so the probe result is memoized in the shared cache for a day
//! keyed by the engine endpoint.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use rand::Rng;

use crate::cache::Cache;
use crate::engine::Engine;

/// Devices a workspace may receive, when the engine host has them.
pub const ALLOWED_DEVICES: [&str; 2] = ["/dev/kvm", "/dev/net/tun"];

/// Minimal image used for the probe container.
const PROBE_IMAGE: &str = "busybox:uclibc";

/// Command listing character devices.
const PROBE_COMMAND: [&str; 4] = ["/bin/find", "/dev", "-type", "c"];

/// How long a probe result stays cached.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The cache key for an engine's device list.
fn cache_key(engine: &Engine) -> String {
    format!("devices-{}", engine.base_url())
}

/// The character devices available on an engine, cached for a day.
///
/// On a cache miss, runs a short-lived privileged container on the engine
/// and parses its output line by line.
///
/// # Errors
///
/// Returns an error if the probe container fails or the cache is
/// unavailable.
pub async fn available_devices(engine: &Engine, cache: &dyn Cache) -> Result<Vec<String>> {
    let key = cache_key(engine);
    if let Some(cached) = cache.get(&key).await? {
        return serde_json::from_str(&cached).context("failed to parse cached device list");
    }

    let name = format!("device-probe-{:08x}", rand::rng().random::<u32>());
    let output = engine
        .run_oneshot(&name, PROBE_IMAGE, &PROBE_COMMAND, true)
        .await
        .context("device probe failed")?;
    let devices: Vec<String> = output.lines().map(str::to_string).collect();

    cache
        .put(
            &key,
            &serde_json::to_string(&devices).context("failed to serialize device list")?,
            Some(CACHE_TTL),
        )
        .await?;
    Ok(devices)
}
