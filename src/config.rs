//! Service configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML
//! file, then environment variables (the deployment's usual interface).

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Default host to bind to.
const DEFAULT_HOST: &str = "0.0.0.0";

/// Default port to bind to.
const DEFAULT_PORT: u16 = 8000;

/// Default Redis URL for the shared cache.
const DEFAULT_REDIS_URL: &str = "redis://cache:6379/0";

/// Default key prefix for job records.
const DEFAULT_JOB_PREFIX: &str = "dojo:docker_job:";

/// Default job record time-to-live, in seconds.
const DEFAULT_JOB_TTL: u64 = 900;

/// Default holding-page refresh interval, in seconds.
const DEFAULT_JOB_REFRESH: u64 = 3;

/// Default host data path (workspace homes, the Nix store).
const DEFAULT_HOST_DATA_PATH: &str = "/data";

/// Default seccomp profile path applied to workspace containers.
const DEFAULT_SECCOMP: &str = "/etc/dojo/seccomp.json";

/// Default wall-clock deadline for one provisioning attempt, in seconds.
const DEFAULT_ATTEMPT_TIMEOUT: u64 = 180;

/// Default challenge catalog file.
const DEFAULT_CATALOG_PATH: &str = "./dojos.toml";

/// Default job prefix function for serde.
fn default_job_prefix() -> String {
    String::from(DEFAULT_JOB_PREFIX)
}

/// Default job TTL function for serde.
fn default_job_ttl() -> u64 {
    DEFAULT_JOB_TTL
}

/// Default refresh interval function for serde.
fn default_job_refresh() -> u64 {
    DEFAULT_JOB_REFRESH
}

/// Default Redis URL function for serde.
fn default_redis_url() -> String {
    String::from(DEFAULT_REDIS_URL)
}

/// Default host data path function for serde.
fn default_host_data_path() -> PathBuf {
    PathBuf::from(DEFAULT_HOST_DATA_PATH)
}

/// Default seccomp profile function for serde.
fn default_seccomp() -> String {
    String::from(DEFAULT_SECCOMP)
}

/// Default attempt timeout function for serde.
fn default_attempt_timeout() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT
}

/// Default catalog path function for serde.
fn default_catalog_path() -> PathBuf {
    PathBuf::from(DEFAULT_CATALOG_PATH)
}

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared cache and job store settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Workspace provisioning settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Container engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Challenge catalog settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind to (default: `0.0.0.0`).
    #[serde(default)]
    pub host: String,
    /// Port to bind to (default: `8000`).
    #[serde(default)]
    pub port: u16,
}

/// Shared cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Redis URL backing the job store, locks, and caches.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Key prefix for job records (default: `dojo:docker_job:`).
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    /// Job record time-to-live in seconds (default: `900`).
    #[serde(default = "default_job_ttl")]
    pub job_ttl: u64,
    /// Holding-page refresh interval in seconds (default: `3`).
    #[serde(default = "default_job_refresh")]
    pub job_refresh: u64,
}

/// Workspace provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Public host used to build job and workspace URLs.
    #[serde(default)]
    pub host: Option<String>,
    /// HMAC key for the workspace handoff signature.
    ///
    /// Required for provisioning to succeed; an unset secret fails the
    /// attempt at signing time.
    #[serde(default)]
    pub secret: Option<String>,
    /// Secret used for option selection and per-user flag serialization.
    #[serde(default)]
    pub secret_key: String,
    /// Host path under which workspace data (homes, the Nix store) lives.
    #[serde(default = "default_host_data_path")]
    pub host_data_path: PathBuf,
    /// Seccomp profile applied to workspace containers.
    #[serde(default = "default_seccomp")]
    pub seccomp: String,
    /// Extra hostname-to-IP entries added to every workspace container.
    #[serde(default)]
    pub user_firewall_allowed: HashMap<String, String>,
    /// Grant internet access to every workspace, awards notwithstanding.
    #[serde(default)]
    pub internet_for_all: bool,
    /// Wall-clock deadline for one provisioning attempt, in seconds.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: u64,
}

/// Container engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Engine API endpoints indexed by node id.
    ///
    /// Empty means a single local engine reached over the default socket.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Name of the private workspace network.
    #[serde(default = "default_workspace_network")]
    pub workspace_network: String,
    /// Name of the default (internet-facing) bridge network.
    #[serde(default = "default_bridge_network")]
    pub default_network: String,
}

/// Default workspace network name function for serde.
fn default_workspace_network() -> String {
    String::from("workspace_net")
}

/// Default bridge network name function for serde.
fn default_bridge_network() -> String {
    String::from("bridge")
}

/// Challenge catalog configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    /// Path to the dojo catalog file.
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            job_prefix: default_job_prefix(),
            job_ttl: DEFAULT_JOB_TTL,
            job_refresh: DEFAULT_JOB_REFRESH,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            host: None,
            secret: None,
            secret_key: String::new(),
            host_data_path: default_host_data_path(),
            seccomp: default_seccomp(),
            user_firewall_allowed: HashMap::new(),
            internet_for_all: false,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nodes: vec![],
            workspace_network: default_workspace_network(),
            default_network: default_bridge_network(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides on top of the current values.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable that must parse (TTL, refresh, the
    /// firewall map) carries an unparseable value.
    pub fn with_env_overrides(mut self) -> anyhow::Result<Self> {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.cache.redis_url = url;
        }

        if let Ok(prefix) = std::env::var("DOCKER_JOB_PREFIX") {
            self.cache.job_prefix = prefix;
        }

        if let Ok(ttl) = std::env::var("DOCKER_JOB_TTL") {
            self.cache.job_ttl = ttl
                .parse()
                .context("`DOCKER_JOB_TTL` must be an integer number of seconds")?;
        }

        if let Ok(refresh) = std::env::var("WORKSPACE_JOB_REFRESH") {
            self.cache.job_refresh = refresh
                .parse()
                .context("`WORKSPACE_JOB_REFRESH` must be an integer number of seconds")?;
        }

        if let Ok(host) = std::env::var("WORKSPACE_HOST") {
            self.workspace.host = Some(host);
        }

        if let Ok(secret) = std::env::var("WORKSPACE_SECRET") {
            self.workspace.secret = Some(secret);
        }

        if let Ok(secret_key) = std::env::var("SECRET_KEY") {
            self.workspace.secret_key = secret_key;
        }

        if let Ok(path) = std::env::var("HOST_DATA_PATH") {
            self.workspace.host_data_path = PathBuf::from(path);
        }

        if let Ok(seccomp) = std::env::var("SECCOMP") {
            self.workspace.seccomp = seccomp;
        }

        if let Ok(allowed) = std::env::var("USER_FIREWALL_ALLOWED") {
            self.workspace.user_firewall_allowed = serde_json::from_str(&allowed)
                .context("`USER_FIREWALL_ALLOWED` must be a JSON object of name to IP")?;
        }

        if let Ok(internet) = std::env::var("INTERNET_FOR_ALL") {
            self.workspace.internet_for_all =
                matches!(internet.as_str(), "1" | "true" | "True" | "yes");
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate configuration.
    ///
    /// Misconfiguration that would otherwise surface deep inside a
    /// provisioning attempt fails here at startup instead.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    fn validate(&self) -> anyhow::Result<()> {
        if self.workspace.secret_key.is_empty() {
            anyhow::bail!(
                "`workspace.secret_key` is empty; set `SECRET_KEY` or `[workspace] secret_key`"
            );
        }

        if self.catalog.path.as_os_str().is_empty() {
            anyhow::bail!("`catalog.path` is empty");
        }

        Ok(())
    }
}
