//! Signed handoff from a finished job to the workspace reverse proxy.
//!
//! The signature covers the workspace identity (short container id, and
//! the owning node's address when the workspace runs off-host) so the
//! downstream proxy can verify the handoff without shared session state.

use anyhow::Result;
use anyhow::bail;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;

use crate::catalog::User;
use crate::config::WorkspaceConfig;

/// HMAC-SHA256 keyed by the workspace secret.
type HmacSha256 = Hmac<Sha256>;

/// Port the reverse proxy forwards to inside the workspace.
const DEFAULT_WORKSPACE_PORT: u16 = 80;

/// Length of the short container id.
const SHORT_ID_LEN: usize = 12;

/// A signed handoff message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    /// The signed message: the short container id, with the node address
    /// appended for off-host workspaces.
    pub message: String,
    /// URL-safe base64 of the HMAC over the message.
    pub signature: String,
}

/// Sign the workspace identity.
pub fn sign(secret: &str, container_id_short: &str, node: Option<u32>) -> Handoff {
    let message = match node {
        Some(node) if node != 0 => {
            format!("{container_id_short}:192.168.42.{}", node + 1)
        }
        _ => container_id_short.to_string(),
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC should accept any key length");
    mac.update(message.as_bytes());
    let signature = URL_SAFE.encode(mac.finalize().into_bytes());

    Handoff { message, signature }
}

/// Compute the workspace URL handed to the user's browser.
///
/// # Errors
///
/// Returns an error if the workspace secret is not configured; this is a
/// fatal misconfiguration that fails the provisioning attempt.
pub fn workspace_url(config: &WorkspaceConfig, user: &User, container_id: &str) -> Result<String> {
    let Some(secret) = config.secret.as_deref() else {
        bail!("WORKSPACE_SECRET is not configured");
    };

    let short = &container_id[..container_id.len().min(SHORT_ID_LEN)];
    let handoff = sign(secret, short, user.node);
    let host = config.host.as_deref().unwrap_or("localhost");

    Ok(format!(
        "https://{host}/workspace/{DEFAULT_WORKSPACE_PORT}/{signature}/{message}/",
        signature = handoff.signature,
        message = handoff.message,
    ))
}
