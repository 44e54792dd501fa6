//! Workspace container construction.
//!
//! Composes the full container specification (identity, environment,
//! mounts, devices, capabilities, limits, runtime, networking) and starts
//! it. The specification is deterministic for a given user, challenge,
//! and configuration.

use std::collections::HashMap;

use anyhow::Result;
use bollard::models::ContainerCreateBody;
use bollard::models::DeviceMapping;
use bollard::models::HostConfig;
use bollard::models::Mount;
use bollard::models::MountBindOptions;
use bollard::models::MountBindOptionsPropagationEnum;
use bollard::models::MountTypeEnum;
use bollard::models::MountVolumeOptions;
use bollard::models::MountVolumeOptionsDriverConfig;
use rand::Rng;

use crate::catalog::ResolvedChallenge;
use crate::config::Config;
use crate::engine::Engine;
use crate::engine::container_name;
use crate::engine::user_ipv4;

use super::LaunchSpec;
use super::devices::ALLOWED_DEVICES;

/// In-container path of the dojo tool bin.
pub const DOJO_BIN_PATH: &str = "/run/dojo/bin";

/// In-container path of the challenge bin.
const CHALLENGE_BIN_PATH: &str = "/run/challenge/bin";

/// The workspace user's home directory.
const HOME_DIR: &str = "/home/hacker";

/// The in-container init process.
const DOJO_INIT: &str = "/nix/var/nix/profiles/dojo-workspace/bin/dojo-init";

/// Maximum hostname length, in bytes.
const MAX_HOSTNAME_LEN: usize = 64;

/// CPU accounting period, in microseconds.
const CPU_PERIOD: i64 = 100_000;

/// CPU quota per period, in microseconds (400%).
const CPU_QUOTA: i64 = 400_000;

/// Maximum number of processes in a workspace.
const PIDS_LIMIT: i64 = 1024;

/// Workspace memory limit, in bytes (4 GiB).
const MEMORY_LIMIT: i64 = 4 * 1024 * 1024 * 1024;

/// VM-isolated runtime used for privileged workspaces.
const KATA_RUNTIME: &str = "io.containerd.run.kata.v2";

/// Default OCI runtime.
const DEFAULT_RUNTIME: &str = "runc";

/// Dojo permission unlocking `NET_ADMIN` in privileged workspaces.
const NET_ADMIN_PERMISSION: &str = "workspace_net_admin";

/// Award granting internet access.
const INTERNET_AWARD: &str = "INTERNET";

/// Name of the `homefs` volume driver.
const HOME_VOLUME_DRIVER: &str = "homefs";

/// The workspace hostname for a challenge.
///
/// An optional `practice` prefix and the module id are joined with `~`
/// to the normalized challenge name, truncated to 64 bytes.
pub fn hostname(practice: bool, module_id: &str, challenge_name: &str) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if practice {
        parts.push(String::from("practice"));
    }
    parts.push(module_id.to_string());
    parts.push(normalize_challenge_name(challenge_name));

    let mut joined = parts.join("~");
    joined.truncate(MAX_HOSTNAME_LEN);
    joined
}

/// Normalize a challenge name into a hostname segment: lowercase, drop
/// everything outside `[a-z0-9 \t.-]`, collapse runs of whitespace, dots,
/// and hyphens into a single `-`.
fn normalize_challenge_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let kept: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || matches!(c, '.' | '-'))
        .collect();

    let mut normalized = String::with_capacity(kept.len());
    let mut in_run = false;
    for c in kept.chars() {
        if c.is_whitespace() || matches!(c, '.' | '-') {
            if !in_run {
                normalized.push('-');
                in_run = true;
            }
        } else {
            normalized.push(c);
            in_run = false;
        }
    }
    normalized
}

/// Map the allowed devices that exist on the engine into `dev:dev:rwm`
/// specifications.
pub fn device_specs(available: &[String]) -> Vec<String> {
    ALLOWED_DEVICES
        .iter()
        .filter(|device| available.iter().any(|a| a == *device))
        .map(|device| format!("{device}:{device}:rwm"))
        .collect()
}

/// Splice the image's `PATH` behind the challenge and dojo bins.
fn env_path(image_env: &[String]) -> String {
    let image_path = image_env
        .iter()
        .find_map(|var| var.strip_prefix("PATH="))
        .unwrap_or_default();

    if image_path.is_empty() {
        format!("{CHALLENGE_BIN_PATH}:{DOJO_BIN_PATH}")
    } else {
        format!("{CHALLENGE_BIN_PATH}:{DOJO_BIN_PATH}:{image_path}")
    }
}

/// Host entries injected into every workspace.
fn extra_hosts(
    hostname: &str,
    workspace_ipv4: &str,
    firewall_allowed: &HashMap<String, String>,
) -> Vec<String> {
    let mut vm_alias = format!("vm_{hostname}");
    vm_alias.truncate(MAX_HOSTNAME_LEN);

    let mut hosts = vec![
        format!("{hostname}:127.0.0.1"),
        String::from("vm:127.0.0.1"),
        format!("{vm_alias}:127.0.0.1"),
        String::from("challenge.localhost:127.0.0.1"),
        String::from("hacker.localhost:127.0.0.1"),
        format!("dojo-user:{workspace_ipv4}"),
    ];
    for (name, ip) in firewall_allowed {
        hosts.push(format!("{name}:{ip}"));
    }
    hosts
}

/// Build and start a workspace container, returning its id.
///
/// The container is created detached from networking defaults, connected
/// to the workspace network under the user's deterministic address, cut
/// off from the default bridge unless the user has internet access, and
/// then started.
///
/// # Errors
///
/// Returns an error if any engine call fails.
pub async fn start_workspace_container(
    engine: &Engine,
    config: &Config,
    spec: &LaunchSpec,
    resolved: &ResolvedChallenge,
    available_devices: &[String],
) -> Result<String> {
    let name = container_name(spec.user.id);
    let hostname = hostname(spec.practice, &spec.challenge.module.id, &spec.challenge.name);
    let workspace_ipv4 = user_ipv4(spec.user.id);
    let auth_token = hex::encode(rand::rng().random::<[u8; 32]>());

    let image_env = engine.image_env(&resolved.image).await?;
    let env = vec![
        format!("HOME={HOME_DIR}"),
        format!("PATH={}", env_path(&image_env)),
        format!("SHELL={DOJO_BIN_PATH}/bash"),
        format!("DOJO_AUTH_TOKEN={auth_token}"),
    ];

    let mut mounts = vec![
        Mount {
            target: Some(String::from("/nix")),
            source: Some(
                config
                    .workspace
                    .host_data_path
                    .join("workspace/nix")
                    .display()
                    .to_string(),
            ),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(true),
            ..Default::default()
        },
        Mount {
            target: Some(String::from("/run/dojo/sys")),
            source: Some(String::from("/run/dojo/dojofs")),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(true),
            bind_options: Some(MountBindOptions {
                propagation: Some(MountBindOptionsPropagationEnum::SLAVE),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    for home in &spec.mounts {
        mounts.push(Mount {
            target: Some(home.target.clone()),
            source: Some(home.volume.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            volume_options: Some(MountVolumeOptions {
                no_copy: Some(true),
                driver_config: Some(MountVolumeOptionsDriverConfig {
                    name: Some(String::from(HOME_VOLUME_DRIVER)),
                    options: Some(home.options.clone()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let devices = device_specs(available_devices)
        .into_iter()
        .map(|mapping| {
            let mut parts = mapping.split(':');
            DeviceMapping {
                path_on_host: parts.next().map(String::from),
                path_in_container: parts.next().map(String::from),
                cgroup_permissions: parts.next().map(String::from),
            }
        })
        .collect();

    let mut capabilities = vec![String::from("SYS_PTRACE")];
    if resolved.privileged {
        capabilities.push(String::from("SYS_ADMIN"));
        if resolved.permissions.contains(NET_ADMIN_PERMISSION) {
            capabilities.push(String::from("NET_ADMIN"));
        }
    }

    let labels = HashMap::from([
        (
            String::from("dojo.dojo_id"),
            spec.dojo.reference_id.clone(),
        ),
        (
            String::from("dojo.module_id"),
            spec.challenge.module.id.clone(),
        ),
        (String::from("dojo.challenge_id"), spec.challenge.id.clone()),
        (
            String::from("dojo.challenge_description"),
            spec.challenge.description.clone(),
        ),
        (String::from("dojo.user_id"), spec.user.id.to_string()),
        (String::from("dojo.as_user_id"), spec.as_user.id.to_string()),
        (String::from("dojo.auth_token"), auth_token),
        (
            String::from("dojo.mode"),
            String::from(if spec.practice { "privileged" } else { "standard" }),
        ),
    ]);

    let host_config = HostConfig {
        mounts: Some(mounts),
        devices: Some(devices),
        cap_add: Some(capabilities),
        security_opt: Some(vec![format!("seccomp={}", config.workspace.seccomp)]),
        sysctls: Some(HashMap::from([(
            String::from("net.ipv4.ip_unprivileged_port_start"),
            String::from("1024"),
        )])),
        cpu_period: Some(CPU_PERIOD),
        cpu_quota: Some(CPU_QUOTA),
        pids_limit: Some(PIDS_LIMIT),
        memory: Some(MEMORY_LIMIT),
        runtime: Some(String::from(if resolved.privileged {
            KATA_RUNTIME
        } else {
            DEFAULT_RUNTIME
        })),
        init: Some(true),
        auto_remove: Some(true),
        extra_hosts: Some(extra_hosts(
            &hostname,
            &workspace_ipv4,
            &config.workspace.user_firewall_allowed,
        )),
        ..Default::default()
    };

    let body = ContainerCreateBody {
        image: Some(resolved.image.clone()),
        entrypoint: Some(vec![
            String::from(DOJO_INIT),
            format!("{DOJO_BIN_PATH}/sleep"),
            String::from("6h"),
        ]),
        hostname: Some(hostname),
        user: Some(String::from("0")),
        working_dir: Some(String::from(HOME_DIR)),
        env: Some(env),
        labels: Some(labels),
        open_stdin: Some(true),
        attach_stdin: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    };

    let container_id = engine.create_container(&name, body).await?;

    engine
        .connect_network(
            &config.engine.workspace_network,
            &name,
            Some(workspace_ipv4),
            vec![name.clone()],
        )
        .await?;

    let internet_access = config.workspace.internet_for_all
        || spec.user.awards.iter().any(|award| award == INTERNET_AWARD);
    if !internet_access {
        engine
            .disconnect_network(&config.engine.default_network, &name)
            .await?;
    }

    engine.start_container(&name).await?;
    Ok(container_id)
}
