//! # Fanout Orchestrator
//!
//! Runs a batch of long GPU jobs, one rented cloud instance per job.
//!
//! ## Architecture
//!
//! ```text
//!  JobCatalog ──► Driver ──► InstanceManager ──► ApiClient ──► control plane
//!                   │              (launch, wait_ready)
//!                   ├──► Packager  (git ls-files + secret → code.tar.gz)
//!                   ├──► BootstrapTemplate (first-boot script per job)
//!                   └──► Deployer ──► SecureCopy (scp to the new host)
//! ```
//!
//! Every job gets its own instance whose first-boot script waits for the
//! code bundle, builds the environment and starts the job in a detached
//! session. The orchestrator only launches, waits and uploads; it does not
//! watch jobs run.
//!
//! ## Failure isolation
//!
//! One job failing (launch rejected, instance never ready, upload refused)
//! is recorded and the batch moves on. Only a missing secret file stops the
//! whole run, and it does so before any instance is launched.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod bundle;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod deploy;
pub mod driver;
pub mod instance;

// Control plane
pub use api::{ApiClient, HttpTransport};
pub use instance::{InstanceManager, PollStep, ReadinessPoll};

// Packaging and delivery
pub use bootstrap::BootstrapTemplate;
pub use bundle::GitTarPackager;
pub use deploy::{Deployer, ScpCopier};

// Orchestration
pub use catalog::{JobCatalog, JobSpec};
pub use clock::TokioClock;
pub use config::{ApiConfig, RunOptions};
pub use driver::{Driver, JobOutcome, OrchestrationResult};

// Error handling
pub use fanout_core::{FanoutError, Result};
