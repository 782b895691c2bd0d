//! Bundle delivery over scp

use async_trait::async_trait;
use fanout_core::{Bundle, FanoutError, RemoteTarget, Result, SecureCopy, TransportError};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info};

use crate::bootstrap::BootstrapTemplate;

/// Arguments for `scp`. Host keys of fresh instances are never known, so
/// checking is off and nothing is recorded.
pub fn scp_args(local: &Path, destination: &RemoteTarget, identity_file: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        identity_file.display().to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        local.display().to_string(),
        destination.to_string(),
    ]
}

/// Interactive login command for a host
pub fn ssh_command(identity_file: &Path, user: &str, host: &str) -> String {
    format!("ssh -i {} {user}@{host}", identity_file.display())
}

/// Copy command an operator can run by hand
pub fn manual_upload_command(local: &Path, destination: &RemoteTarget, identity_file: &Path) -> String {
    let mut parts = vec!["scp".to_string()];
    parts.extend(scp_args(local, destination, identity_file));
    parts.join(" ")
}

/// [`SecureCopy`] via the system `scp` binary
#[derive(Debug, Clone)]
pub struct ScpCopier {
    program: String,
}

impl ScpCopier {
    /// Use `scp` from `PATH`
    pub fn new() -> Self {
        Self {
            program: "scp".to_string(),
        }
    }
}

impl Default for ScpCopier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureCopy for ScpCopier {
    async fn copy(
        &self,
        local: &Path,
        destination: &RemoteTarget,
        identity_file: &Path,
    ) -> std::result::Result<(), TransportError> {
        let output = Command::new(&self.program)
            .args(scp_args(local, destination, identity_file))
            .output()
            .await
            .map_err(|e| TransportError::Spawn {
                program: self.program.clone(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TransportError::Exit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Places the bundle where the first-boot script waits for it
#[derive(Clone)]
pub struct Deployer {
    copier: Arc<dyn SecureCopy>,
    remote_user: String,
    remote_path: String,
}

impl Deployer {
    /// Deliver to the user and path the bootstrap template expects
    pub fn new(copier: Arc<dyn SecureCopy>, template: &BootstrapTemplate) -> Self {
        Self {
            copier,
            remote_user: template.remote_user.clone(),
            remote_path: template.bundle_path(),
        }
    }

    /// Account used for copies and logins
    pub fn remote_user(&self) -> &str {
        &self.remote_user
    }

    /// Destination for a host
    pub fn target(&self, address: &str) -> RemoteTarget {
        RemoteTarget {
            user: self.remote_user.clone(),
            host: address.to_string(),
            path: self.remote_path.clone(),
        }
    }

    /// Copy the bundle to `address`, authenticating with `identity_file`.
    ///
    /// Failures come back as `Deployment` carrying the copy tool's diagnostics.
    pub async fn deploy(&self, address: &str, bundle: &Bundle, identity_file: &Path) -> Result<()> {
        let target = self.target(address);
        info!(destination = %target, size_bytes = bundle.size_bytes(), "Uploading bundle");

        match self.copier.copy(bundle.path(), &target, identity_file).await {
            Ok(()) => {
                info!(host = %address, "Bundle uploaded");
                Ok(())
            }
            Err(e) => {
                error!(host = %address, error = %e, "Bundle upload failed");
                Err(FanoutError::Deployment(e))
            }
        }
    }

    /// Hand-run equivalent of [`Deployer::deploy`]
    pub fn manual_upload_command(&self, address: &str, bundle: &Bundle, identity_file: &Path) -> String {
        manual_upload_command(bundle.path(), &self.target(address), identity_file)
    }
}
