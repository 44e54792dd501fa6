//! Workspace API handlers under `/docker`.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use tracing::error;
use tracing::warn;

use crate::catalog::DojoChallenge;
use crate::catalog::TokenError;
use crate::catalog::User;
use crate::jobs::Job;

use super::AppState;
use super::AuthedUser;
use super::error::Error;
use super::models::CurrentResponse;
use super::models::FailureResponse;
use super::models::MessageResponse;
use super::models::NextResponse;
use super::models::StartRequest;
use super::models::StartResponse;

/// Lease on the per-user start lock.
const LOCK_LEASE: Duration = Duration::from_secs(20);

/// Error returned while another start request holds the lock.
const LOCK_CONTENTION_ERROR: &str = "Already starting a challenge; try again in 20 seconds.";

/// Header designating an impersonation target for inspection flows.
const WORKSPACE_TOKEN_HEADER: &str = "X-Workspace-Token";

/// Container label prefix keys read back by the API.
const LABEL_DOJO: &str = "dojo.dojo_id";

/// Module id label.
const LABEL_MODULE: &str = "dojo.module_id";

/// Challenge id label.
const LABEL_CHALLENGE: &str = "dojo.challenge_id";

/// Mode label; `privileged` means practice by convention.
const LABEL_MODE: &str = "dojo.mode";

/// A user-actionable failure tuple (HTTP 200).
fn failure(message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(FailureResponse {
            success: false,
            error: message.into(),
        }),
    )
        .into_response()
}

/// Create a workspace start job.
///
/// Guarded by a per-user advisory lock so a user can only have one start
/// request in flight; the lock is held across job creation and worker
/// spawn only, not across the worker's lifetime.
///
/// # Errors
///
/// Returns 401 for invalid workspace tokens; every other failure is a
/// `{success: false, error}` tuple.
pub async fn start_workspace(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<Response, Error> {
    let lock_key = format!("user.{}.docker.lock", user.id);
    let lock = match state.cache.try_lock(&lock_key, LOCK_LEASE).await {
        Ok(Some(lock)) => lock,
        Ok(None) => return Ok(failure(LOCK_CONTENTION_ERROR)),
        Err(e) => {
            warn!("failed to acquire start lock for user `{}`: {e:#}", user.id);
            return Ok(failure("Failed to start a workspace job. Please retry."));
        }
    };

    let result = handle_start(&state, &user, &headers, request).await;

    if let Err(e) = state.cache.unlock(&lock).await {
        warn!("failed to release start lock for user `{}`: {e:#}", user.id);
    }

    result
}

/// The locked portion of workspace creation.
async fn handle_start(
    state: &AppState,
    user: &User,
    headers: &HeaderMap,
    request: StartRequest,
) -> Result<Response, Error> {
    let mut as_user = resolve_workspace_token(state, user, headers).await?;

    let dojo = match state.catalog.accessible_dojo(user, &request.dojo).await {
        Ok(Some(dojo)) => dojo,
        Ok(None) => return Ok(failure("Invalid dojo")),
        Err(e) => {
            warn!("failed to resolve dojo `{}`: {e:#}", request.dojo);
            return Ok(failure("Invalid dojo"));
        }
    };

    let challenge = match state
        .catalog
        .challenge(&dojo, Some(&request.module), &request.challenge)
        .await
    {
        Ok(Some(challenge)) => challenge,
        Ok(None) => return Ok(failure("Invalid challenge")),
        Err(e) => {
            warn!("failed to resolve challenge `{}`: {e:#}", request.challenge);
            return Ok(failure("Invalid challenge"));
        }
    };

    if !challenge.visible && !dojo.is_admin(user) {
        return Ok(failure("Invalid challenge"));
    }

    if request.practice && !challenge.allow_privileged {
        return Ok(failure("This challenge does not support practice mode."));
    }

    match state.catalog.challenge_locked(user, &dojo, &challenge).await {
        Ok(true) => return Ok(failure("This challenge is locked")),
        Ok(false) => {}
        Err(e) => {
            warn!("failed to check lock state for `{}`: {e:#}", challenge.id);
            return Ok(failure("Invalid challenge"));
        }
    }

    if dojo.is_admin(user) {
        if let Some(raw) = &request.as_user {
            let display = match raw {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let Some(target_id) = parse_user_id(raw) else {
                return Ok(failure(format!("Invalid user ID ({display})")));
            };

            if user.admin {
                as_user = state.catalog.user(target_id).await.ok().flatten();
            } else {
                // Dojo admins may only impersonate official students of
                // their own dojo.
                let Some(student) = dojo.students.iter().find(|s| s.user_id == target_id) else {
                    return Ok(failure(format!("Not a student in this dojo ({target_id})")));
                };
                if !student.official {
                    return Ok(failure(format!(
                        "Not an official student in this dojo ({target_id})"
                    )));
                }
                match state.catalog.user(target_id).await {
                    Ok(Some(target)) => as_user = Some(target),
                    _ => return Ok(failure(format!("Invalid user ID ({target_id})"))),
                }
            }
        }
    }

    let mut job = Job::new(user, as_user.as_ref(), &dojo, &challenge, request.practice);
    if let Err(e) = state.jobs.put(&mut job).await {
        warn!("failed to store job for user `{}`: {e:#}", user.id);
        return Ok(failure("Failed to start a workspace job. Please retry."));
    }

    let job_url = workspace_job_url(state, headers, &job.id, &job.token);

    let provisioner = state.provisioner.clone();
    let job_id = job.id.clone();
    tokio::spawn(async move {
        provisioner.run(&job_id).await;
    });

    let message = job_url
        .is_none()
        .then(|| String::from("Workspace queued"));
    Ok((
        StatusCode::OK,
        Json(StartResponse {
            success: true,
            job_id: job.id,
            job_url,
            message,
        }),
    )
        .into_response())
}

/// Resolve the optional workspace-token header to an impersonation
/// target.
async fn resolve_workspace_token(
    state: &AppState,
    user: &User,
    headers: &HeaderMap,
) -> Result<Option<User>, Error> {
    let Some(token) = headers
        .get(WORKSPACE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };

    match state.catalog.workspace_token_user(token).await {
        Ok(target) => Ok(Some(target)),
        Err(e @ (TokenError::Unknown | TokenError::Expired)) => {
            Err(Error::Unauthorized(e.to_string()))
        }
        Err(TokenError::Other(e)) => {
            error!("error resolving workspace token for {}: {e:#}", user.id);
            Err(Error::Unauthorized(String::from(
                "Internal error while resolving workspace token",
            )))
        }
    }
}

/// Parse an `as_user` value that may arrive as a JSON number or string.
fn parse_user_id(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// The public holding-page URL for a job, when a workspace host is
/// configured.
fn workspace_job_url(
    state: &AppState,
    headers: &HeaderMap,
    job_id: &str,
    token: &str,
) -> Option<String> {
    let host = state.config.workspace.host.as_deref()?;
    let scheme = headers
        .get("X-Forwarded-Proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("https");
    Some(format!("{scheme}://{host}/workspace/job/{job_id}/{token}"))
}

/// The current workspace's coordinates, read back from container labels.
async fn current_coordinates(
    state: &AppState,
    user: &User,
) -> Option<(String, DojoChallenge, bool)> {
    let labels = match state.launcher.current_labels(user).await {
        Ok(labels) => labels?,
        Err(e) => {
            warn!("failed to inspect container for user `{}`: {e:#}", user.id);
            return None;
        }
    };

    let dojo_reference = labels.get(LABEL_DOJO)?;
    let module_id = labels.get(LABEL_MODULE)?;
    let challenge_id = labels.get(LABEL_CHALLENGE)?;
    let practice = labels.get(LABEL_MODE).map(String::as_str) == Some("privileged");

    let dojo = state.catalog.dojo(dojo_reference).await.ok().flatten()?;
    let challenge = state
        .catalog
        .challenge(&dojo, Some(module_id), challenge_id)
        .await
        .ok()
        .flatten()?;

    Some((dojo.reference_id, challenge, practice))
}

/// Report the caller's current workspace coordinates.
///
/// # Errors
///
/// Returns 401 for unauthenticated requests.
pub async fn current_workspace(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
) -> Result<Response, Error> {
    let Some((dojo_reference, challenge, practice)) = current_coordinates(&state, &user).await
    else {
        return Ok(failure("No active challenge"));
    };

    Ok((
        StatusCode::OK,
        Json(CurrentResponse {
            success: true,
            dojo: dojo_reference,
            module: challenge.module.id.clone(),
            challenge: challenge.id,
            practice,
        }),
    )
        .into_response())
}

/// Tear down the caller's workspace.
///
/// # Errors
///
/// Returns 401 for unauthenticated requests.
pub async fn terminate_workspace(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
) -> Result<Response, Error> {
    let current = state.launcher.current_labels(&user).await;
    if !matches!(current, Ok(Some(_))) {
        return Ok(failure("No active challenge container"));
    }

    match state.launcher.teardown(&user).await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(MessageResponse {
                success: true,
                message: String::from("Challenge container terminated"),
            }),
        )
            .into_response()),
        Err(e) => {
            error!("failed to terminate container for user {}: {e:#}", user.id);
            Ok(failure("Failed to terminate container"))
        }
    }
}

/// Compute the next challenge after the caller's current one, spilling
/// into the first challenge of the next module.
///
/// # Errors
///
/// Returns 401 for unauthenticated requests.
pub async fn next_challenge(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
) -> Result<Response, Error> {
    let Some((dojo_reference, current, _)) = current_coordinates(&state, &user).await else {
        return Ok(failure("No active challenge"));
    };

    let Some(dojo) = state.catalog.dojo(&dojo_reference).await.ok().flatten() else {
        return Ok(failure("No active challenge"));
    };

    let challenges = state
        .catalog
        .module_challenges(&dojo, &current.module.id)
        .await
        .unwrap_or_default();
    let Some(position) = challenges.iter().position(|c| c.id == current.id) else {
        return Ok(failure("Current challenge not found in module"));
    };

    if let Some(next) = challenges.get(position + 1) {
        return Ok((
            StatusCode::OK,
            Json(NextResponse {
                success: true,
                dojo: dojo.reference_id,
                module: next.module.id.clone(),
                challenge: next.id.clone(),
                challenge_index: next.index,
                new_module: None,
            }),
        )
            .into_response());
    }

    if let Some(next_module) = state
        .catalog
        .next_module(&dojo, current.module.index)
        .await
        .ok()
        .flatten()
    {
        let first = state
            .catalog
            .module_challenges(&dojo, &next_module.id)
            .await
            .unwrap_or_default()
            .into_iter()
            .next();
        if let Some(first) = first {
            return Ok((
                StatusCode::OK,
                Json(NextResponse {
                    success: true,
                    dojo: dojo.reference_id,
                    module: first.module.id.clone(),
                    challenge: first.id.clone(),
                    challenge_index: first.index,
                    new_module: Some(true),
                }),
            )
                .into_response());
        }
    }

    Ok(failure("No next challenge available"))
}
