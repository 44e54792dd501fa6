//! Tests for the `/docker` API surface.

use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use dojod::cache::Cache;
use dojod::jobs::JobState;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::TestApp;
use super::read_json;

/// Wait for a job to reach a terminal state.
async fn wait_terminal(app: &TestApp, job_id: &str) -> dojod::jobs::Job {
    for _ in 0..100 {
        let job = app.jobs.get(job_id).await.unwrap().expect("job should exist");
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job `{job_id}` never reached a terminal state");
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let app = TestApp::new();

    let response = app
        .request(
            Request::builder()
                .method("POST")
                .uri("/docker")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"dojo": "intro", "module": "warmup", "challenge": "hello"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
    let (status, body) = read_json(response).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Missing session token");
}

#[tokio::test]
async fn start_creates_a_job_and_returns_its_url() {
    let app = TestApp::new();

    let (status, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello", "practice": false}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let job_id = body["job_id"].as_str().unwrap();
    let job_url = body["job_url"].as_str().unwrap();

    let job = app.jobs.get(job_id).await.unwrap().expect("job should exist");
    assert_eq!(
        job_url,
        format!("https://dojo.test/workspace/job/{}/{}", job.id, job.token)
    );

    let job = wait_terminal(&app, job_id).await;
    assert_eq!(job.state, JobState::Ready);
    assert!(job.workspace_url.is_some());
}

#[tokio::test]
async fn invalid_dojo_module_and_challenge_are_rejected() {
    let app = TestApp::new();

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "nope", "module": "warmup", "challenge": "hello"}),
        )
        .await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Invalid dojo");

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "binary", "challenge": "hello"}),
        )
        .await;
    assert_eq!(body["error"], "Invalid challenge");

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "missing"}),
        )
        .await;
    assert_eq!(body["error"], "Invalid challenge");
}

#[tokio::test]
async fn hidden_challenges_are_invalid_for_students_but_not_admins() {
    let app = TestApp::new();

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hidden"}),
        )
        .await;
    assert_eq!(body["error"], "Invalid challenge");

    // The dojo admin can start it.
    let (_, body) = app
        .post_docker(
            "carol-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hidden"}),
        )
        .await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn practice_requires_allow_privileged() {
    let app = TestApp::new();

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "goodbye", "practice": true}),
        )
        .await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "This challenge does not support practice mode.");
}

#[tokio::test]
async fn locked_challenges_are_refused() {
    let app = TestApp::new();

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "gated"}),
        )
        .await;
    assert_eq!(body["error"], "This challenge is locked");
}

#[tokio::test]
async fn held_lock_rejects_a_second_start() {
    let app = TestApp::new();

    let _lock = app
        .cache
        .try_lock("user.2.docker.lock", Duration::from_secs(20))
        .await
        .unwrap()
        .expect("lock should be free");

    let (status, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello"}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(
        body["error"],
        "Already starting a challenge; try again in 20 seconds."
    );
}

#[tokio::test]
async fn lock_is_released_after_a_start() {
    let app = TestApp::new();

    let (_, body) = app
        .post_docker(
            "bob-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello"}),
        )
        .await;
    assert_eq!(body["success"], true);

    // The handler released the lock on return.
    let lock = app
        .cache
        .try_lock("user.2.docker.lock", Duration::from_secs(20))
        .await
        .unwrap();
    assert!(lock.is_some());
}

#[tokio::test]
async fn workspace_token_errors_are_401() {
    let app = TestApp::new();

    let response = app
        .request(
            Request::builder()
                .method("POST")
                .uri("/docker")
                .header("content-type", "application/json")
                .header("authorization", "Bearer bob-session")
                .header("X-Workspace-Token", "garbage")
                .body(Body::from(
                    json!({"dojo": "intro", "module": "warmup", "challenge": "hello"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid workspace token");

    let response = app
        .request(
            Request::builder()
                .method("POST")
                .uri("/docker")
                .header("content-type", "application/json")
                .header("authorization", "Bearer bob-session")
                .header("X-Workspace-Token", "inspect-erin")
                .body(Body::from(
                    json!({"dojo": "intro", "module": "warmup", "challenge": "hello"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "This workspace token has expired");
}

#[tokio::test]
async fn workspace_token_designates_the_impersonation_target() {
    let app = TestApp::new();

    let response = app
        .request(
            Request::builder()
                .method("POST")
                .uri("/docker")
                .header("content-type", "application/json")
                .header("authorization", "Bearer carol-session")
                .header("X-Workspace-Token", "inspect-bob")
                .body(Body::from(
                    json!({"dojo": "intro", "module": "warmup", "challenge": "hello"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
    let (_, body) = read_json(response).await;
    assert_eq!(body["success"], true);

    let job = app
        .jobs
        .get(body["job_id"].as_str().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.as_user_id, Some(2));
    assert_eq!(job.as_user_name.as_deref(), Some("bob"));
}

#[tokio::test]
async fn global_admin_impersonates_any_user() {
    let app = TestApp::new();

    let (_, body) = app
        .post_docker(
            "alice-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello", "as_user": 2}),
        )
        .await;
    assert_eq!(body["success"], true);

    let job = app
        .jobs
        .get(body["job_id"].as_str().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.user_id, 1);
    assert_eq!(job.as_user_id, Some(2));
}

#[tokio::test]
async fn dojo_admin_impersonation_is_limited_to_official_students() {
    let app = TestApp::new();

    // Not a student at all.
    let (_, body) = app
        .post_docker(
            "carol-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello", "as_user": 5}),
        )
        .await;
    assert_eq!(body["error"], "Not a student in this dojo (5)");

    // A student, but not official.
    let (_, body) = app
        .post_docker(
            "carol-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello", "as_user": 4}),
        )
        .await;
    assert_eq!(body["error"], "Not an official student in this dojo (4)");

    // An official student, id given as a string.
    let (_, body) = app
        .post_docker(
            "carol-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello", "as_user": "2"}),
        )
        .await;
    assert_eq!(body["success"], true);

    // Garbage id.
    let (_, body) = app
        .post_docker(
            "carol-session",
            json!({"dojo": "intro", "module": "warmup", "challenge": "hello", "as_user": "x"}),
        )
        .await;
    assert_eq!(body["error"], "Invalid user ID (x)");
}

#[tokio::test]
async fn current_workspace_reads_container_labels() {
    let app = TestApp::new();

    let (_, body) = app.get("bob-session", "/docker").await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No active challenge");

    app.launcher.set_labels(&[
        ("dojo.dojo_id", "intro"),
        ("dojo.module_id", "warmup"),
        ("dojo.challenge_id", "hello"),
        ("dojo.mode", "privileged"),
    ]);

    let (_, body) = app.get("bob-session", "/docker").await;
    assert_eq!(body["success"], true);
    assert_eq!(body["dojo"], "intro");
    assert_eq!(body["module"], "warmup");
    assert_eq!(body["challenge"], "hello");
    assert_eq!(body["practice"], true);
}

#[tokio::test]
async fn terminate_requires_a_container() {
    let app = TestApp::new();

    let response = app
        .request(
            Request::builder()
                .method("DELETE")
                .uri("/docker")
                .header("authorization", "Bearer bob-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let (_, body) = read_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No active challenge container");

    app.launcher.set_labels(&[
        ("dojo.dojo_id", "intro"),
        ("dojo.module_id", "warmup"),
        ("dojo.challenge_id", "hello"),
        ("dojo.mode", "standard"),
    ]);

    let response = app
        .request(
            Request::builder()
                .method("DELETE")
                .uri("/docker")
                .header("authorization", "Bearer bob-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let (_, body) = read_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Challenge container terminated");
    assert_eq!(
        app.launcher
            .teardowns
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn next_challenge_walks_the_module_and_spills_over() {
    let app = TestApp::new();

    let (_, body) = app.get("bob-session", "/docker/next").await;
    assert_eq!(body["error"], "No active challenge");

    // In the middle of a module: the next challenge follows in order.
    app.launcher.set_labels(&[
        ("dojo.dojo_id", "intro"),
        ("dojo.module_id", "warmup"),
        ("dojo.challenge_id", "hello"),
        ("dojo.mode", "standard"),
    ]);
    let (_, body) = app.get("bob-session", "/docker/next").await;
    assert_eq!(body["success"], true);
    assert_eq!(body["module"], "warmup");
    assert_eq!(body["challenge"], "goodbye");
    assert_eq!(body["challenge_index"], 1);
    assert!(body.get("new_module").is_none());

    // At the end of a module: spill into the next module.
    app.launcher.set_labels(&[
        ("dojo.dojo_id", "intro"),
        ("dojo.module_id", "warmup"),
        ("dojo.challenge_id", "gated"),
        ("dojo.mode", "standard"),
    ]);
    let (_, body) = app.get("bob-session", "/docker/next").await;
    assert_eq!(body["success"], true);
    assert_eq!(body["module"], "binary");
    assert_eq!(body["challenge"], "bof");
    assert_eq!(body["new_module"], true);

    // At the end of the dojo: nothing left.
    app.launcher.set_labels(&[
        ("dojo.dojo_id", "intro"),
        ("dojo.module_id", "binary"),
        ("dojo.challenge_id", "bof"),
        ("dojo.mode", "standard"),
    ]);
    let (_, body) = app.get("bob-session", "/docker/next").await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No next challenge available");
}
