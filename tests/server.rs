//! Workspace API integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::Response;
use dojod::cache::Cache;
use dojod::cache::MemoryCache;
use dojod::catalog::FileCatalog;
use dojod::catalog::User;
use dojod::config::Config;
use dojod::events::ChallengeEvent;
use dojod::events::EventSink;
use dojod::jobs::JobStore;
use dojod::provision::LaunchSpec;
use dojod::provision::LaunchedWorkspace;
use dojod::provision::Launcher;
use dojod::provision::Provisioner;
use dojod::server::AppState;
use dojod::server::create_router;
use http_body_util::BodyExt;
use tower::ServiceExt;

#[path = "server/api.rs"]
mod api;

/// A catalog exercising the authorization chain: a global admin, a dojo
/// admin, students (official and not), and outsiders.
pub const CATALOG: &str = r#"
    [[users]]
    id = 1
    name = "alice"
    admin = true
    session_token = "alice-session"

    [[users]]
    id = 2
    name = "bob"
    session_token = "bob-session"
    workspace_token = "inspect-bob"

    [[users]]
    id = 3
    name = "carol"
    session_token = "carol-session"

    [[users]]
    id = 4
    name = "dave"
    session_token = "dave-session"

    [[users]]
    id = 5
    name = "erin"
    session_token = "erin-session"
    workspace_token = "inspect-erin"
    workspace_token_expired = true

    [[dojos]]
    id = 10
    reference = "intro"
    name = "Intro"
    official = true
    admins = [3]

    [[dojos.students]]
    user_id = 2
    official = true

    [[dojos.students]]
    user_id = 4
    official = false

    [[dojos.modules]]
    id = "warmup"
    name = "Warmup"

    [[dojos.modules.challenges]]
    id = "hello"
    challenge_id = 100
    name = "Hello"
    image = "workspace:latest"

    [[dojos.modules.challenges]]
    id = "goodbye"
    challenge_id = 101
    name = "Goodbye"
    image = "workspace:latest"
    allow_privileged = false

    [[dojos.modules.challenges]]
    id = "hidden"
    challenge_id = 102
    name = "Hidden"
    image = "workspace:latest"
    visible = false

    [[dojos.modules.challenges]]
    id = "gated"
    challenge_id = 103
    name = "Gated"
    image = "workspace:latest"
    locked = true

    [[dojos.modules]]
    id = "binary"
    name = "Binary"

    [[dojos.modules.challenges]]
    id = "bof"
    challenge_id = 104
    name = "Buffer Overflow"
    image = "workspace:latest"
"#;

/// A launcher stub whose label inspection is scriptable.
#[derive(Debug, Default)]
pub struct StubLauncher {
    /// Labels reported for the current container, if any.
    pub labels: Mutex<Option<HashMap<String, String>>>,
    /// Number of teardown calls observed.
    pub teardowns: AtomicU32,
}

impl StubLauncher {
    /// Script the labels of the user's current container.
    pub fn set_labels(&self, labels: &[(&str, &str)]) {
        *self.labels.lock().unwrap() = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
}

#[async_trait]
impl Launcher for StubLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<LaunchedWorkspace> {
        Ok(LaunchedWorkspace {
            container_id: String::from("abcdef0123456789abcdef0123456789"),
        })
    }

    async fn teardown(&self, _user: &User) -> Result<()> {
        self.teardowns
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn current_labels(&self, _user: &User) -> Result<Option<HashMap<String, String>>> {
        Ok(self.labels.lock().unwrap().clone())
    }
}

/// An event sink that discards everything.
#[derive(Debug, Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish_container_start(
        &self,
        _user: &User,
        _mode: &str,
        _challenge: &ChallengeEvent,
    ) -> Result<()> {
        Ok(())
    }
}

/// A wired-up API under test.
pub struct TestApp {
    /// The router.
    pub app: Router,
    /// The shared cache, for lock manipulation.
    pub cache: Arc<MemoryCache>,
    /// The job store.
    pub jobs: JobStore,
    /// The launcher stub.
    pub launcher: Arc<StubLauncher>,
}

impl TestApp {
    /// Build the API over in-memory seams.
    pub fn new() -> Self {
        let mut config = Config::default();
        config.workspace.secret = Some(String::from("s"));
        config.workspace.host = Some(String::from("dojo.test"));
        let config = Arc::new(config);

        let cache = Arc::new(MemoryCache::new());
        let cache_seam: Arc<dyn Cache> = cache.clone();
        let jobs = JobStore::new(
            cache_seam.clone(),
            config.cache.job_prefix.clone(),
            Duration::from_secs(config.cache.job_ttl),
        );
        let catalog = Arc::new(FileCatalog::from_toml(CATALOG).unwrap());
        let launcher = Arc::new(StubLauncher::default());
        let events = Arc::new(NullEventSink);

        let provisioner = Provisioner::new(
            jobs.clone(),
            catalog.clone(),
            launcher.clone(),
            events.clone(),
            config.clone(),
        );

        let state = AppState {
            config,
            cache: cache_seam,
            jobs: jobs.clone(),
            catalog,
            launcher: launcher.clone(),
            provisioner,
        };

        Self {
            app: create_router(state),
            cache,
            jobs,
            launcher,
        }
    }

    /// Issue a request and return the response.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Issue an authenticated JSON POST to `/docker`.
    pub async fn post_docker(
        &self,
        session: &str,
        body: serde_json::Value,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        let response = self
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/docker")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {session}"))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        read_json(response).await
    }

    /// Issue an authenticated GET.
    pub async fn get(
        &self,
        session: &str,
        uri: &str,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        let response = self
            .request(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .header("authorization", format!("Bearer {session}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        read_json(response).await
    }
}

/// Collect a response's status and JSON body.
pub async fn read_json(response: Response<Body>) -> (axum::http::StatusCode, serde_json::Value) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}
