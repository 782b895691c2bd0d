//! Core types shared across Fanout components

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Unique identifier for an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instance lifecycle status as reported by the vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Instance is starting up
    Booting,
    /// Instance is running and reachable
    Active,
    /// Instance is gone
    Terminated,
    /// Instance failed to provision
    Error,
    /// Any other vendor state (unhealthy, terminating, missing, ...)
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// Parse a vendor status string. Unrecognised values are `Unknown`.
    pub fn from_vendor(s: &str) -> Self {
        match s {
            "booting" => Self::Booting,
            "active" => Self::Active,
            "terminated" => Self::Terminated,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Terminal failure: waiting any longer cannot help
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Terminal success
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Booting => "booting",
            Self::Active => "active",
            Self::Terminated => "terminated",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance information
///
/// Only ever observed through the control plane; never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: Option<String>,
    pub instance_type: Option<String>,
    pub region: Option<String>,
    pub status: InstanceStatus,
    /// Public address, `None` until the instance is active
    pub ip: Option<String>,
}

impl Instance {
    /// Reachable address, only when the instance is active
    pub fn ready_address(&self) -> Option<&str> {
        if self.status.is_ready() {
            self.ip.as_deref().filter(|ip| !ip.is_empty())
        } else {
            None
        }
    }
}

/// An instance type offered by the vendor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeOffer {
    pub name: String,
    pub description: String,
    pub price_cents_per_hour: u64,
    /// Regions that currently have capacity
    pub regions: Vec<String>,
}

impl InstanceTypeOffer {
    /// Hourly price in dollars
    pub fn price_per_hour(&self) -> f64 {
        self.price_cents_per_hour as f64 / 100.0
    }

    pub fn has_capacity(&self) -> bool {
        !self.regions.is_empty()
    }
}

/// Launch parameters for one control-plane launch call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    #[serde(rename = "instance_type_name")]
    pub instance_type: String,
    #[serde(rename = "region_name")]
    pub region: String,
    pub ssh_key_names: Vec<String>,
    pub quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "file_system_names", skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Boot-time script (cloud-init user data)
    #[serde(rename = "user_data", skip_serializing_if = "Option::is_none")]
    pub bootstrap_script: Option<String>,
}

impl LaunchRequest {
    pub fn new(
        instance_type: impl Into<String>,
        region: impl Into<String>,
        ssh_key_names: Vec<String>,
    ) -> Self {
        Self {
            instance_type: instance_type.into(),
            region: region.into(),
            ssh_key_names,
            quantity: 1,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_attachment(mut self, file_system: impl Into<String>) -> Self {
        self.attachments.push(file_system.into());
        self
    }

    pub fn with_bootstrap_script(mut self, script: impl Into<String>) -> Self {
        self.bootstrap_script = Some(script.into());
        self
    }
}

/// HTTP method of a control-plane call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// A fully prepared control-plane request, credential attached
#[derive(Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    /// Endpoint path, e.g. `/api/v1/instances`
    pub endpoint: String,
    pub url: String,
    pub api_key: String,
    /// Serialized JSON payload
    pub body: Option<String>,
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("body", &self.body.as_ref().map(|b| b.len()))
            .finish()
    }
}

/// Destination of a secure copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.path)
    }
}

/// Packaged code-plus-secrets archive
///
/// Read-only once built; consumed by [`Bundle::remove`] so it can only be
/// deleted once.
#[derive(Debug, PartialEq, Eq)]
pub struct Bundle {
    path: PathBuf,
    size_bytes: u64,
    secret_entry: Option<String>,
}

impl Bundle {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            secret_entry: None,
        }
    }

    /// Record where the secret file sits, relative to the archive root
    pub fn with_secret_entry(mut self, entry: impl Into<String>) -> Self {
        self.secret_entry = Some(entry.into());
        self
    }

    pub fn secret_entry(&self) -> Option<&str> {
        self.secret_entry.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }

    /// Delete the archive from disk
    pub fn remove(self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// Per-job progress
///
/// Transitions only move forward; the failure states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Launching,
    Ready,
    Deployed,
    LaunchFailed,
    /// Readiness wait exhausted while the instance was still booting
    NotReady,
    DeployFailed,
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Launching => 1,
            Self::Ready => 2,
            Self::Deployed => 3,
            Self::LaunchFailed | Self::NotReady | Self::DeployFailed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::LaunchFailed | Self::NotReady | Self::DeployFailed
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::LaunchFailed | Self::NotReady | Self::DeployFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::Ready => "ready",
            Self::Deployed => "deployed",
            Self::LaunchFailed => "launch_failed",
            Self::NotReady => "not_ready",
            Self::DeployFailed => "deploy_failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named unit of work, bound to at most one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub command: String,
    pub instance_id: Option<InstanceId>,
    pub status: JobStatus,
}

impl Job {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            instance_id: None,
            status: JobStatus::Pending,
        }
    }

    /// Move to `next`. Returns `false` (and stays put) when the move would
    /// go backwards or leave a terminal state.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    pub fn bind(&mut self, instance_id: InstanceId) {
        self.instance_id = Some(instance_id);
    }
}
