//! Holding and error page markup.

use dojod::jobs::Job;
use maud::DOCTYPE;
use maud::PreEscaped;
use maud::html;

/// Shared page styling.
const PAGE_CSS: &str = r#"
body {
    font-family: -apple-system,BlinkMacSystemFont,"Segoe UI",sans-serif;
    background-color: #050607;
    color: #f2f4f8;
    margin: 0;
    display: flex;
    align-items: center;
    justify-content: center;
    min-height: 100vh;
}
.wrap {
    text-align: center;
    max-width: 480px;
    padding: 2rem;
}
.spinner {
    width: 3rem;
    height: 3rem;
    border: 0.35rem solid rgba(255,255,255,.2);
    border-top-color: #f29f05;
    border-radius: 50%;
    margin: 0 auto 1.5rem;
    animation: spin 0.8s linear infinite;
}
@keyframes spin {
    to { transform: rotate(360deg); }
}
h1.failed {
    color: #ff6673;
}
"#;

/// The auto-refreshing page served while a job is pending or running.
pub fn wait_page(job: &Job, refresh: u64) -> String {
    let challenge = if job.challenge_name.is_empty() {
        "workspace"
    } else {
        &job.challenge_name
    };
    let dojo = if job.dojo_name.is_empty() {
        "dojo"
    } else {
        &job.dojo_name
    };
    let mut message = format!("Preparing {challenge} ({dojo})");
    if job.practice {
        message.push_str(" in practice mode");
    }

    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta http-equiv="refresh" content=(refresh);
                title { "Preparing workspace…" }
                style { (PreEscaped(PAGE_CSS)) }
            }
            body {
                div class="wrap" {
                    div class="spinner" {}
                    h1 { "Hang tight…" }
                    p { (message) ". This page refreshes automatically." }
                }
            }
        }
    }
    .into_string()
}

/// The page served for a job that ended in error.
pub fn error_page(job: &Job) -> String {
    let detail = job
        .error
        .as_deref()
        .unwrap_or("Workspace failed to initialize.");

    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "Workspace failed to start" }
                style { (PreEscaped(PAGE_CSS)) }
            }
            body {
                div class="wrap" {
                    h1 class="failed" { "Workspace failed to start" }
                    p { (detail) }
                    p { "Please restart the challenge." }
                }
            }
        }
    }
    .into_string()
}
