//! Fan-out driver
//!
//! Runs each selected job through its lifecycle:
//!
//! ```text
//! pending → launching → ready → deployed
//!              │          │        │
//!              ▼          ▼        ▼
//!        launch_failed  not_ready  deploy_failed
//! ```
//!
//! A failing job never stops the others. The bundle is built once up front
//! (a missing secret aborts the run before anything is launched), shared by
//! every job and deleted exactly once after the results are written.

use fanout_core::{Bundle, FanoutError, InstanceId, Job, JobStatus, LaunchRequest, Packager, Result};
use futures::stream::{self, StreamExt};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bootstrap::BootstrapTemplate;
use crate::config::RunOptions;
use crate::deploy::{Deployer, ssh_command};
use crate::instance::InstanceManager;

/// Instance id recorded for every job in a dry run
pub const DRY_RUN_INSTANCE_ID: &str = "dry-run-instance-id";

/// Address recorded for every job in a dry run
pub const DRY_RUN_IP: &str = "127.0.0.1";

/// Final record for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    /// Instance is up and holds the bundle
    Success {
        /// Last lifecycle stage reached
        stage: JobStatus,
        /// Instances launched for the job
        instance_ids: Vec<InstanceId>,
        /// Public address
        ip: String,
        /// Login command
        ssh_command: String,
    },
    /// Job stopped early.
    ///
    /// A `deploy_failed` entry still has a running, billed instance: `ip`
    /// and `ssh_command` are set and `error` ends with the `scp` command
    /// that completes the upload by hand. Terminate it if the job is not
    /// wanted.
    Error {
        /// Stage the job failed in
        stage: JobStatus,
        /// Human-readable reason, vendor text included
        error: String,
        /// Instances launched before the failure
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        instance_ids: Vec<InstanceId>,
        /// Address, when one was known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        /// Login command, when an address was known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_command: Option<String>,
    },
}

impl JobOutcome {
    /// Placeholder recorded when nothing is launched
    pub fn dry_run() -> Self {
        Self::Success {
            stage: JobStatus::Pending,
            instance_ids: vec![InstanceId::new(DRY_RUN_INSTANCE_ID)],
            ip: DRY_RUN_IP.to_string(),
            ssh_command: String::new(),
        }
    }

    fn failed(stage: JobStatus, error: impl Into<String>, instance_ids: Vec<InstanceId>) -> Self {
        Self::Error {
            stage,
            error: error.into(),
            instance_ids,
            ip: None,
            ssh_command: None,
        }
    }

    /// Whether the job succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Stage recorded for the job
    pub fn stage(&self) -> JobStatus {
        match self {
            Self::Success { stage, .. } | Self::Error { stage, .. } => *stage,
        }
    }

    /// Instances launched for the job
    pub fn instance_ids(&self) -> &[InstanceId] {
        match self {
            Self::Success { instance_ids, .. } | Self::Error { instance_ids, .. } => instance_ids,
        }
    }

    /// Failure reason
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { error, .. } => Some(error),
        }
    }
}

/// Outcomes keyed by job name, in job order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestrationResult {
    entries: Vec<(String, JobOutcome)>,
}

impl Serialize for OrchestrationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, outcome) in &self.entries {
            map.serialize_entry(name, outcome)?;
        }
        map.end()
    }
}

impl FromIterator<(String, JobOutcome)> for OrchestrationResult {
    fn from_iter<I: IntoIterator<Item = (String, JobOutcome)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl OrchestrationResult {
    /// Outcome of one job
    pub fn get(&self, job_name: &str) -> Option<&JobOutcome> {
        self.entries
            .iter()
            .find(|(name, _)| name == job_name)
            .map(|(_, outcome)| outcome)
    }

    /// Entries in job order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobOutcome)> {
        self.entries.iter().map(|(name, outcome)| (name.as_str(), outcome))
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no jobs ran
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful jobs
    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.is_success()).count()
    }

    /// Write the document as pretty JSON
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), jobs = self.len(), "Saved results");
        Ok(())
    }
}

/// Drives jobs from launch to delivered bundle
pub struct Driver {
    instances: InstanceManager,
    packager: Arc<dyn Packager>,
    deployer: Deployer,
    template: BootstrapTemplate,
    options: RunOptions,
}

impl Driver {
    /// Create a driver
    pub fn new(
        instances: InstanceManager,
        packager: Arc<dyn Packager>,
        deployer: Deployer,
        template: BootstrapTemplate,
        options: RunOptions,
    ) -> Self {
        Self {
            instances,
            packager,
            deployer,
            template,
            options,
        }
    }

    /// Options in effect
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run every job.
    ///
    /// Per-job failures are recorded, not returned. The only errors are
    /// preflight failures (invalid template, missing secret, packaging) and
    /// failing to write the results file.
    pub async fn run(&self, jobs: Vec<Job>) -> Result<OrchestrationResult> {
        if self.options.dry_run {
            for job in &jobs {
                info!(job = %job.name, command = %job.command, "Dry run: would launch job");
            }
            return Ok(jobs
                .into_iter()
                .map(|job| (job.name, JobOutcome::dry_run()))
                .collect());
        }

        self.template.validate()?;
        let bundle = self.packager.build(&self.options.secret_file).await?;
        let template = self.template_for(&bundle);

        let concurrency = self.options.concurrency.max(1);
        let shared = &bundle;
        let template = &template;
        let entries: Vec<(String, JobOutcome)> = stream::iter(jobs)
            .map(|job| async move {
                let name = job.name.clone();
                let outcome = self.run_job(job, template, shared).await;
                (name, outcome)
            })
            .buffered(concurrency)
            .collect()
            .await;
        let result: OrchestrationResult = entries.into_iter().collect();

        let persisted = result.persist(&self.options.results_path);
        let bundle_path = bundle.path().to_path_buf();
        match bundle.remove() {
            Ok(()) => info!(path = %bundle_path.display(), "Removed bundle"),
            Err(e) => warn!(path = %bundle_path.display(), error = %e, "Failed to remove bundle"),
        }
        persisted?;

        info!(
            succeeded = result.success_count(),
            total = result.len(),
            "Orchestration finished"
        );
        Ok(result)
    }

    /// The remote script must look for the secret where the bundle put it
    fn template_for(&self, bundle: &Bundle) -> BootstrapTemplate {
        match bundle.secret_entry() {
            Some(entry) if entry != self.template.secret_file => {
                info!(secret = entry, "Using secret path from bundle");
                self.template.clone().with_secret_file(entry)
            }
            _ => self.template.clone(),
        }
    }

    fn launch_request(&self, job: &Job, script: String) -> LaunchRequest {
        let mut request = LaunchRequest::new(
            &self.options.instance_type,
            &self.options.region,
            self.options.ssh_key_names.clone(),
        )
        .with_name(self.options.instance_name(&job.name))
        .with_bootstrap_script(script);
        for file_system in &self.options.attachments {
            request = request.with_attachment(file_system);
        }
        request
    }

    async fn run_job(&self, mut job: Job, template: &BootstrapTemplate, bundle: &Bundle) -> JobOutcome {
        info!(job = %job.name, "Starting job");
        job.advance(JobStatus::Launching);

        let launched = self.launch(&job, template).await;
        let instance_ids = match launched {
            Ok(ids) => ids,
            Err(e) => {
                error!(job = %job.name, error = %e, "Launch failed");
                job.advance(JobStatus::LaunchFailed);
                return JobOutcome::failed(job.status, e.to_string(), Vec::new());
            }
        };
        let instance_id = instance_ids[0].clone();
        job.bind(instance_id.clone());

        match self
            .instances
            .wait_ready(&instance_id, self.options.ready_timeout, self.options.poll_interval)
            .await
        {
            Ok(true) => {
                job.advance(JobStatus::Ready);
            }
            Ok(false) => {
                job.advance(JobStatus::NotReady);
                let reason = format!(
                    "instance {instance_id} not active within {}s",
                    self.options.ready_timeout.as_secs()
                );
                warn!(job = %job.name, instance_id = %instance_id, "{reason}");
                return JobOutcome::failed(job.status, reason, instance_ids);
            }
            Err(e) => {
                error!(job = %job.name, instance_id = %instance_id, error = %e, "Instance failed before becoming active");
                job.advance(JobStatus::LaunchFailed);
                return JobOutcome::failed(job.status, e.to_string(), instance_ids);
            }
        }

        let ip = match self.instances.get(&instance_id).await {
            Ok(instance) => match instance.ready_address() {
                Some(ip) => ip.to_string(),
                None => {
                    job.advance(JobStatus::NotReady);
                    return JobOutcome::failed(
                        job.status,
                        format!("instance {instance_id} is {} with no public address", instance.status),
                        instance_ids,
                    );
                }
            },
            Err(e) => {
                job.advance(JobStatus::NotReady);
                return JobOutcome::failed(job.status, e.to_string(), instance_ids);
            }
        };

        let ssh = ssh_command(&self.options.ssh_key_file, self.deployer.remote_user(), &ip);
        match self.deployer.deploy(&ip, bundle, &self.options.ssh_key_file).await {
            Ok(()) => {
                job.advance(JobStatus::Deployed);
                info!(job = %job.name, instance_id = %instance_id, ip = %ip, "Job deployed");
                JobOutcome::Success {
                    stage: job.status,
                    instance_ids,
                    ip,
                    ssh_command: ssh,
                }
            }
            Err(e) => {
                job.advance(JobStatus::DeployFailed);
                let manual = self
                    .deployer
                    .manual_upload_command(&ip, bundle, &self.options.ssh_key_file);
                warn!(job = %job.name, ip = %ip, "Upload by hand with: {manual}");
                JobOutcome::Error {
                    stage: job.status,
                    error: format!("{e}; upload manually with: {manual}"),
                    instance_ids,
                    ip: Some(ip),
                    ssh_command: Some(ssh),
                }
            }
        }
    }

    /// Secret re-check, script rendering and the launch call
    async fn launch(&self, job: &Job, template: &BootstrapTemplate) -> Result<Vec<InstanceId>> {
        if !self.options.secret_file.exists() {
            return Err(FanoutError::MissingSecret(self.options.secret_file.clone()));
        }
        let script = template.generate(&job.name, &job.command)?;
        let request = self.launch_request(job, script);
        self.instances.launch(&request).await
    }
}
