//! Operation options and results, plus the JSON shapes exchanged with the
//! host for them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::rpc::RequestOptions;
use crate::vfs::{VfsInterceptionConfig, WireVfsInterception};

/// A secret the host injects into outbound traffic to `hosts`. The guest
/// only ever sees a placeholder.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("hosts", &self.hosts)
            .finish()
    }
}

/// A host directory exposed inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: String,
    pub guest_path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Everything needed to create a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub image: String,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_size_mb: Option<u64>,
    /// Lifetime of the sandbox; the host tears it down afterwards.
    pub timeout_seconds: Option<u64>,
    /// Hosts the guest may reach. Empty leaves the host's default policy.
    pub allowed_hosts: Vec<String>,
    pub block_private_ips: bool,
    pub secrets: Vec<Secret>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub workspace: Option<String>,
    pub vfs: Option<VfsInterceptionConfig>,
}

impl CreateOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }

    pub fn with_secret(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.secrets.push(Secret {
            name: name.into(),
            value: value.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_vfs(mut self, vfs: VfsInterceptionConfig) -> Self {
        self.vfs = Some(vfs);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub(crate) fn request_options(&self) -> RequestOptions {
        RequestOptions {
            cancel: self.cancel.clone(),
            timeout: self.timeout,
            on_notification: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStreamResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub is_dir: bool,
}

/// Forward `local_port` on the host machine to `remote_port` in the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardBinding {
    pub address: String,
    pub local_port: u16,
    pub remote_port: u16,
}

// ── Wire shapes ──

#[derive(Debug, Serialize)]
pub(crate) struct CreateParams {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkParams>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfs: Option<VfsParams>,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct ResourceParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NetworkParams {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,
    pub block_private_ips: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<Secret>,
}

#[derive(Debug, Serialize)]
pub(crate) struct VfsParams {
    pub interception: WireVfsInterception,
}

impl CreateParams {
    pub fn new(options: &CreateOptions, interception: Option<WireVfsInterception>) -> Self {
        let resources = if options.cpus.is_none()
            && options.memory_mb.is_none()
            && options.disk_size_mb.is_none()
            && options.timeout_seconds.is_none()
        {
            None
        } else {
            Some(ResourceParams {
                cpus: options.cpus,
                memory_mb: options.memory_mb,
                disk_size_mb: options.disk_size_mb,
                timeout_seconds: options.timeout_seconds,
            })
        };

        let network = if options.allowed_hosts.is_empty()
            && options.secrets.is_empty()
            && !options.block_private_ips
        {
            None
        } else {
            Some(NetworkParams {
                allowed_hosts: options.allowed_hosts.clone(),
                block_private_ips: options.block_private_ips,
                secrets: options.secrets.clone(),
            })
        };

        Self {
            image: options.image.clone(),
            resources,
            network,
            env: options.env.clone(),
            mounts: options.mounts.clone(),
            workspace: options.workspace.clone(),
            vfs: interception.map(|interception| VfsParams { interception }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExecParams<'a> {
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<&'a str>,
}

/// Output fields are base64.
#[derive(Debug, Deserialize)]
pub(crate) struct ExecResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecStreamResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadFileResponse {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListFilesResponse {
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortForwardResponse {
    #[serde(default)]
    pub bindings: Vec<PortForwardBinding>,
}

/// Params of the `event` notification.
#[derive(Debug, Deserialize)]
pub(crate) struct EventParams {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: Option<FileEventParams>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileEventParams {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}
