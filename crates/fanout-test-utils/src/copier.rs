//! Recording secure-copy fake

use async_trait::async_trait;
use fanout_core::{RemoteTarget, SecureCopy, TransportError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One recorded copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    pub local: PathBuf,
    pub destination: RemoteTarget,
    pub identity_file: PathBuf,
}

/// Records copies instead of performing them. Hosts registered with
/// [`RecordingCopier::fail_for`] get an scp-style exit error.
#[derive(Debug, Default)]
pub struct RecordingCopier {
    copies: Mutex<Vec<CopyRecord>>,
    failing_hosts: Mutex<HashSet<String>>,
}

impl RecordingCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, host: &str) -> &Self {
        self.failing_hosts.lock().unwrap().insert(host.to_string());
        self
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecureCopy for RecordingCopier {
    async fn copy(
        &self,
        local: &Path,
        destination: &RemoteTarget,
        identity_file: &Path,
    ) -> Result<(), TransportError> {
        self.copies.lock().unwrap().push(CopyRecord {
            local: local.to_path_buf(),
            destination: destination.clone(),
            identity_file: identity_file.to_path_buf(),
        });

        if self.failing_hosts.lock().unwrap().contains(&destination.host) {
            return Err(TransportError::Exit {
                program: "scp".to_string(),
                code: Some(255),
                stderr: format!("ssh: connect to host {} port 22: Connection refused", destination.host),
            });
        }
        Ok(())
    }
}
