//! API request and response models.

use serde::Deserialize;
use serde::Serialize;

/// Request body for `POST /docker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Dojo reference id.
    pub dojo: String,
    /// Module id within the dojo.
    pub module: String,
    /// Challenge id within the module.
    pub challenge: String,
    /// Whether to start in practice mode.
    #[serde(default)]
    pub practice: bool,
    /// User to impersonate; accepted from dojo admins.
    #[serde(default)]
    pub as_user: Option<serde_json::Value>,
}

/// Response body for a successful `POST /docker`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    /// Always `true`.
    pub success: bool,
    /// The created job's id.
    pub job_id: String,
    /// Public URL of the job's holding page, when a workspace host is
    /// configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_url: Option<String>,
    /// Informational message when no job URL is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response body for user-actionable failures.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailureResponse {
    /// Always `false`.
    pub success: bool,
    /// What went wrong.
    pub error: String,
}

/// Response body for `GET /docker`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentResponse {
    /// Always `true`.
    pub success: bool,
    /// Dojo reference id.
    pub dojo: String,
    /// Module id.
    pub module: String,
    /// Challenge id.
    pub challenge: String,
    /// Whether the workspace runs in practice mode.
    pub practice: bool,
}

/// Response body for `DELETE /docker`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Outcome description.
    pub message: String,
}

/// Response body for `GET /docker/next`.
#[derive(Debug, Serialize, Deserialize)]
pub struct NextResponse {
    /// Always `true`.
    pub success: bool,
    /// Dojo reference id.
    pub dojo: String,
    /// Module id of the next challenge.
    pub module: String,
    /// Challenge id of the next challenge.
    pub challenge: String,
    /// Position of the next challenge within its module.
    pub challenge_index: i64,
    /// Present and `true` when the next challenge opens a new module.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_module: Option<bool>,
}
