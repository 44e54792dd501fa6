//! Retry-loop and outcome tests for the provisioning orchestrator.

use std::sync::atomic::Ordering;

use dojod::jobs::JobState;
use pretty_assertions::assert_eq;

use super::Harness;
use super::LaunchBehavior;

#[tokio::test(start_paused = true)]
async fn failing_launches_retry_three_times_then_error() {
    let harness = Harness::new(LaunchBehavior::Fail);
    let job = harness.seed_job(2, None, "hello", false).await;

    let started = tokio::time::Instant::now();
    harness.provisioner.run(&job.id).await;
    let elapsed = started.elapsed();

    // Two 2 s backoffs between the three attempts.
    assert!(elapsed >= std::time::Duration::from_secs(4));
    assert_eq!(harness.launcher.launches.load(Ordering::SeqCst), 3);
    assert_eq!(harness.launcher.teardowns.load(Ordering::SeqCst), 3);

    let job = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(
        job.error.as_deref(),
        Some("Workspace failed to start. Please retry.")
    );
    assert!(job.finished_at.is_some());
    assert!(job.workspace_url.is_none());

    assert!(harness.events.events.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_launches_hit_the_attempt_deadline() {
    let harness = Harness::new(LaunchBehavior::Hang);
    let job = harness.seed_job(2, None, "hello", false).await;

    harness.provisioner.run(&job.id).await;

    assert_eq!(harness.launcher.launches.load(Ordering::SeqCst), 3);

    let job = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(
        job.error.as_deref(),
        Some("Workspace failed to start. Please retry.")
    );
}

#[tokio::test(start_paused = true)]
async fn successful_launch_marks_the_job_ready() {
    let harness = Harness::new(LaunchBehavior::Succeed);
    let job = harness.seed_job(2, None, "hello", false).await;

    harness.provisioner.run(&job.id).await;

    assert_eq!(harness.launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(harness.launcher.teardowns.load(Ordering::SeqCst), 1);

    let job = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Ready);
    assert!(job.finished_at.is_some());
    assert!(job.error.is_none());

    // The handoff URL covers the short container id on the workspace
    // host.
    let url = job.workspace_url.expect("ready jobs carry a URL");
    assert!(url.starts_with("https://dojo.test/workspace/80/"));
    assert!(url.ends_with("/abcdef012345/"));
}

#[tokio::test(start_paused = true)]
async fn official_dojo_start_publishes_an_event() {
    let harness = Harness::new(LaunchBehavior::Succeed);
    let job = harness.seed_job(2, None, "hello", true).await;

    harness.provisioner.run(&job.id).await;

    let events = harness.events.events.lock().unwrap().clone();
    assert_eq!(events, vec![(2, String::from("practice"), String::from("intro"))]);
}

#[tokio::test(start_paused = true)]
async fn impersonation_builds_overlay_mounts_and_credits_the_student() {
    let harness = Harness::new(LaunchBehavior::Succeed);
    let job = harness.seed_job(1, Some(2), "hello", false).await;

    harness.provisioner.run(&job.id).await;

    let spec = harness
        .launcher
        .last_spec
        .lock()
        .unwrap()
        .clone()
        .expect("launch should have been attempted");
    assert_eq!(spec.user.id, 1);
    assert_eq!(spec.as_user.id, 2);
    assert!(spec.impersonating());

    assert_eq!(spec.mounts.len(), 2);
    assert_eq!(spec.mounts[0].target, "/home/hacker");
    assert_eq!(spec.mounts[0].volume, "1-overlay");
    assert_eq!(spec.mounts[0].options.get("overlay").unwrap(), "2");
    assert_eq!(spec.mounts[1].target, "/home/me");
    assert_eq!(spec.mounts[1].volume, "1");

    // The event credits the impersonated student.
    let events = harness.events.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![(2, String::from("assessment"), String::from("intro"))]
    );
}

#[tokio::test(start_paused = true)]
async fn vanished_job_aborts_silently() {
    let harness = Harness::new(LaunchBehavior::Succeed);

    harness.provisioner.run("no-such-job").await;

    assert_eq!(harness.launcher.launches.load(Ordering::SeqCst), 0);
    assert!(harness.jobs.get("no-such-job").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_records_invalidate_the_request() {
    let harness = Harness::new(LaunchBehavior::Succeed);
    let mut job = harness.seed_job(2, None, "hello", false).await;
    // Point the job at a user that no longer exists.
    job.user_id = 999;
    harness.jobs.put(&mut job).await.unwrap();

    harness.provisioner.run(&job.id).await;

    let job = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(
        job.error.as_deref(),
        Some("Workspace request is no longer valid.")
    );
    assert_eq!(harness.launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn observed_states_form_a_monotone_prefix() {
    let harness = Harness::new(LaunchBehavior::Succeed);
    let job = harness.seed_job(2, None, "hello", false).await;

    let before = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(before.state, JobState::Pending);

    harness.provisioner.run(&job.id).await;

    let after = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Ready);
    assert!(after.updated_at >= before.updated_at);
}
