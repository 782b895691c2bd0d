//! Core traits for Fanout
//!
//! Every side effect the orchestrator performs goes through one of these
//! seams. Production implementations live in `fanout-orchestrator`; scripted
//! fakes live in `fanout-test-utils`.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::types::{ApiRequest, Bundle, RemoteTarget};

/// Request/response exchange with the vendor control plane.
///
/// Returns the raw response body. Interpreting it (JSON, error envelopes)
/// is the API client's job, not the transport's.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> std::result::Result<String, TransportError>;
}

/// Secure remote copy of a local file to a freshly created host.
#[async_trait]
pub trait SecureCopy: Send + Sync {
    async fn copy(
        &self,
        local: &Path,
        destination: &RemoteTarget,
        identity_file: &Path,
    ) -> std::result::Result<(), TransportError>;
}

/// Monotonic time source with sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Builds the deployable bundle.
#[async_trait]
pub trait Packager: Send + Sync {
    /// Fails with `MissingSecret` when `secret_file` does not exist.
    async fn build(&self, secret_file: &Path) -> Result<Bundle>;
}
