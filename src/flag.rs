//! Deterministic per-user flag serialization.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;

/// HMAC-SHA256 keyed by the platform secret.
type HmacSha256 = Hmac<Sha256>;

/// Serialize a user-specific flag for a challenge.
///
/// The value is deterministic for a given `(secret, user, challenge)`
/// triple: the user and challenge ids followed by a truncated MAC, all
/// URL-safe base64. The surrounding `pwn.college{...}` wrapper is applied
/// at injection time.
pub fn serialize_user_flag(secret: &str, user_id: i64, challenge_id: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC should accept any key length");
    mac.update(format!("flag:{user_id}:{challenge_id}").as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(&user_id.to_le_bytes());
    payload.extend_from_slice(&challenge_id.to_le_bytes());
    payload.extend_from_slice(&digest[..16]);
    URL_SAFE_NO_PAD.encode(payload)
}
