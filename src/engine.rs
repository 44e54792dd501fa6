//! Thin typed shim over the container engine's management API.
//!
//! [`Engine`] wraps one engine endpoint with the operations the
//! provisioning pipeline needs; [`EngineRouter`] resolves which engine a
//! given user's workspace lives on. Everything else (what to create, when
//! to tear down) belongs to the provisioning layer.

use std::collections::HashMap;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bollard::Docker;
use bollard::body_full;
use bollard::container::LogOutput;
use bollard::exec::CreateExecOptions;
use bollard::exec::StartExecResults;
use bollard::models::ContainerCreateBody;
use bollard::models::EndpointIpamConfig;
use bollard::models::EndpointSettings;
use bollard::models::NetworkConnectRequest;
use bollard::models::NetworkDisconnectRequest;
use bollard::query_parameters::AttachContainerOptionsBuilder;
use bollard::query_parameters::CreateContainerOptionsBuilder;
use bollard::query_parameters::InspectContainerOptions;
use bollard::query_parameters::LogsOptionsBuilder;
use bollard::query_parameters::RemoveContainerOptionsBuilder;
use bollard::query_parameters::RemoveVolumeOptions;
use bollard::query_parameters::StartContainerOptions;
use bollard::query_parameters::WaitContainerOptions;
use bollard::query_parameters::WaitContainerOptionsBuilder;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;

use crate::catalog::User;
use crate::config::EngineConfig;

/// Timeout for engine API connections, in seconds.
const CONNECT_TIMEOUT: u64 = 120;

/// The deterministic name of a user's workspace container.
pub fn container_name(user_id: i64) -> String {
    format!("user_{user_id}")
}

/// The deterministic workspace-network IPv4 address of a user.
///
/// Addresses are laid out within `10.114.0.0/16`, offset past the
/// subnet's reserved low addresses.
pub fn user_ipv4(user_id: i64) -> String {
    let host = (user_id as u64 + 16) & 0xffff;
    format!("10.114.{}.{}", host >> 8, host & 0xff)
}

/// A handle to one container engine endpoint.
#[derive(Debug, Clone)]
pub struct Engine {
    /// The underlying engine client.
    docker: Docker,
    /// The endpoint this handle points at; used as a cache key.
    base_url: String,
}

impl Engine {
    /// Connect to the local engine socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is unreachable.
    pub fn connect_local() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to local engine")?;
        Ok(Self {
            docker,
            base_url: String::from("local"),
        })
    }

    /// Connect to a remote engine over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn connect_http(addr: &str) -> Result<Self> {
        let docker = Docker::connect_with_http(addr, CONNECT_TIMEOUT, bollard::API_DEFAULT_VERSION)
            .with_context(|| format!("failed to connect to engine at `{addr}`"))?;
        Ok(Self {
            docker,
            base_url: addr.to_string(),
        })
    }

    /// The endpoint identity of this engine.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a container and return its id.
    pub async fn create_container(&self, name: &str, body: ContainerCreateBody) -> Result<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::default().name(name).build()),
                body,
            )
            .await
            .context("failed to create container")?;
        Ok(response.id)
    }

    /// Start a created container.
    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .context("failed to start container")?;
        Ok(())
    }

    /// Force-remove a container.
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await
            .context("failed to remove container")?;
        Ok(())
    }

    /// Wait until a container has been removed.
    pub async fn wait_removed(&self, name: &str) -> Result<()> {
        self.docker
            .wait_container(
                name,
                Some(
                    WaitContainerOptionsBuilder::default()
                        .condition("removed")
                        .build(),
                ),
            )
            .try_collect::<Vec<_>>()
            .await
            .context("failed to wait for container removal")?;
        Ok(())
    }

    /// Wait until a container exits.
    pub async fn wait_exit(&self, name: &str) -> Result<()> {
        self.docker
            .wait_container(name, None::<WaitContainerOptions>)
            .try_collect::<Vec<_>>()
            .await
            .context("failed to wait for container exit")?;
        Ok(())
    }

    /// Stream a container's combined stdout/stderr from the beginning,
    /// following new output.
    pub fn stream_logs(&self, name: &str) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        self.docker
            .logs(
                name,
                Some(
                    LogsOptionsBuilder::default()
                        .follow(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .map(|chunk| {
                chunk
                    .map(|log| log.into_bytes().to_vec())
                    .map_err(anyhow::Error::from)
            })
    }

    /// Collect a stopped container's output.
    pub async fn collect_logs(&self, name: &str) -> Result<String> {
        let chunks: Vec<LogOutput> = self
            .docker
            .logs(
                name,
                Some(
                    LogsOptionsBuilder::default()
                        .follow(false)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .try_collect()
            .await
            .context("failed to read container logs")?;

        let mut output = String::new();
        for chunk in chunks {
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }

    /// Write a line to a container's stdin over an attach channel.
    pub async fn write_stdin(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut results = self
            .docker
            .attach_container(
                name,
                Some(
                    AttachContainerOptionsBuilder::default()
                        .stdin(true)
                        .stream(true)
                        .build(),
                ),
            )
            .await
            .context("failed to attach to container")?;

        results
            .input
            .write_all(data)
            .await
            .context("failed to write to container stdin")?;
        results
            .input
            .flush()
            .await
            .context("failed to flush container stdin")?;
        Ok(())
    }

    /// Unpack a tar archive into a container path.
    pub async fn upload_archive(&self, name: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        self.docker
            .upload_to_container(
                name,
                Some(
                    bollard::query_parameters::UploadToContainerOptionsBuilder::default()
                        .path(path)
                        .build(),
                ),
                body_full(archive.into()),
            )
            .await
            .with_context(|| format!("failed to upload archive to `{path}`"))?;
        Ok(())
    }

    /// Run a command inside a running container, failing on a non-zero
    /// exit status.
    pub async fn exec(&self, name: &str, cmd: &[&str]) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(String::from("0")),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("failed to start exec")?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.context("failed to read exec output")?;
                    output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec")?;
        if let Some(code) = inspect.exit_code {
            if code != 0 {
                bail!("command `{}` exited with status {code}: {output}", cmd.join(" "));
            }
        }
        Ok(output)
    }

    /// The environment of an image's config.
    pub async fn image_env(&self, image: &str) -> Result<Vec<String>> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .with_context(|| format!("failed to inspect image `{image}`"))?;
        Ok(inspect.config.and_then(|c| c.env).unwrap_or_default())
    }

    /// The labels of a container, or `None` if no such container exists.
    pub async fn container_labels(&self, name: &str) -> Result<Option<HashMap<String, String>>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(
                inspect.config.and_then(|c| c.labels).unwrap_or_default(),
            )),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e).context("failed to inspect container"),
        }
    }

    /// Remove a named volume.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .with_context(|| format!("failed to remove volume `{name}`"))?;
        Ok(())
    }

    /// Connect a container to a network with a fixed address and aliases.
    pub async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4_address: Option<String>,
        aliases: Vec<String>,
    ) -> Result<()> {
        self.docker
            .connect_network(
                network,
                NetworkConnectRequest {
                    container: Some(container.to_string()),
                    endpoint_config: Some(EndpointSettings {
                        aliases: Some(aliases),
                        ipam_config: ipv4_address.map(|ipv4_address| EndpointIpamConfig {
                            ipv4_address: Some(ipv4_address),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                },
            )
            .await
            .with_context(|| format!("failed to connect container to `{network}`"))?;
        Ok(())
    }

    /// Disconnect a container from a network.
    pub async fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                NetworkDisconnectRequest {
                    container: Some(container.to_string()),
                    force: Some(false),
                },
            )
            .await
            .with_context(|| format!("failed to disconnect container from `{network}`"))?;
        Ok(())
    }

    /// Run a short-lived container to completion and return its output.
    ///
    /// Used by the device probe; the container is removed afterwards.
    pub async fn run_oneshot(
        &self,
        name: &str,
        image: &str,
        cmd: &[&str],
        privileged: bool,
    ) -> Result<String> {
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            host_config: Some(bollard::models::HostConfig {
                privileged: Some(privileged),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_container(name, body).await?;
        let result = async {
            self.start_container(name).await?;
            self.wait_exit(name).await?;
            self.collect_logs(name).await
        }
        .await;
        let _ = self.remove_container(name).await;
        result
    }
}

/// Resolves the engine a user's workspace runs on.
///
/// With an empty node list every user maps to the local engine. The image
/// hint lets teardown reach an engine a previous workspace may have been
/// started on; static layouts route by the user's pinned node and ignore
/// it.
#[derive(Debug, Clone)]
pub struct EngineRouter {
    /// Engine endpoints indexed by node id.
    nodes: Vec<String>,
}

impl EngineRouter {
    /// Create a router from engine configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            nodes: config.nodes.clone(),
        }
    }

    /// Resolve the engine for a user's workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine endpoint cannot be resolved.
    pub fn for_user(&self, user: &User, _image_hint: Option<&str>) -> Result<Engine> {
        match user.node {
            Some(node) if !self.nodes.is_empty() => {
                let addr = &self.nodes[node as usize % self.nodes.len()];
                Engine::connect_http(addr)
            }
            _ => Engine::connect_local(),
        }
    }
}
