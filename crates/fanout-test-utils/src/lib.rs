//! Shared test utilities for fanout tests
//!
//! In-memory implementations of every seam trait in `fanout-core`:
//!
//! - [`MockControlPlane`]: scripted vendor API responses, records requests
//! - [`ManualClock`]: virtual time that advances only on `sleep`
//! - [`RecordingCopier`]: records secure copies, fails on demand
//! - [`FakePackager`]: writes a small archive, honours the secret check

pub mod clock;
pub mod control_plane;
pub mod copier;
pub mod packager;

pub use clock::ManualClock;
pub use control_plane::{MockControlPlane, error_body, instance_body, launch_body};
pub use copier::{CopyRecord, RecordingCopier};
pub use packager::FakePackager;

/// Instance type used across test fixtures
pub const TEST_INSTANCE_TYPE: &str = "gpu_1x_a10";

/// Region used across test fixtures
pub const TEST_REGION: &str = "us-east-1";

/// API key used across test fixtures
pub const TEST_API_KEY: &str = "secret_test_key";
