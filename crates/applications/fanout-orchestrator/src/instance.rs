//! Instance lifecycle against the control plane
//!
//! Launch, inspect, wait for readiness, terminate and restart. The vendor
//! JSON shapes are decoded into `fanout-core` types here and nowhere else.

use fanout_core::{
    Clock, FanoutError, Instance, InstanceId, InstanceStatus, InstanceTypeOffer, LaunchRequest,
    Result,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, data};

/// Instance collection endpoint
pub const INSTANCES_ENDPOINT: &str = "/api/v1/instances";
/// Instance type catalog endpoint
pub const INSTANCE_TYPES_ENDPOINT: &str = "/api/v1/instance-types";
/// Launch endpoint
pub const LAUNCH_ENDPOINT: &str = "/api/v1/instance-operations/launch";
/// Terminate endpoint
pub const TERMINATE_ENDPOINT: &str = "/api/v1/instance-operations/terminate";
/// Restart endpoint
pub const RESTART_ENDPOINT: &str = "/api/v1/instance-operations/restart";

/// Readiness timeout when the caller has no preference
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);
/// Poll interval when the caller has no preference
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Endpoint for a single instance
pub fn instance_endpoint(id: &InstanceId) -> String {
    format!("{INSTANCES_ENDPOINT}/{id}")
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VendorInstance {
    id: String,
    name: Option<String>,
    ip: Option<String>,
    status: Option<String>,
    region: Option<NamedRef>,
    instance_type: Option<NamedRef>,
}

impl From<VendorInstance> for Instance {
    fn from(v: VendorInstance) -> Self {
        Instance {
            id: InstanceId::new(v.id),
            name: v.name,
            instance_type: v.instance_type.map(|t| t.name),
            region: v.region.map(|r| r.name),
            status: v
                .status
                .as_deref()
                .map(InstanceStatus::from_vendor)
                .unwrap_or(InstanceStatus::Unknown),
            ip: v.ip,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LaunchData {
    #[serde(default)]
    instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VendorTypeSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    price_cents_per_hour: u64,
}

#[derive(Debug, Deserialize)]
struct VendorOffer {
    instance_type: VendorTypeSpec,
    #[serde(default)]
    regions_with_capacity_available: Vec<NamedRef>,
}

/// What a readiness loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Sleep and poll again
    Continue,
    /// Instance is active
    Ready,
    /// Instance reached a terminal failure state
    Failed(InstanceStatus),
    /// Time budget spent
    TimedOut,
}

/// Readiness state machine, independent of any clock or transport.
///
/// The deadline is checked before every poll, so a zero timeout never polls
/// and a poll interval longer than the timeout polls exactly once.
#[derive(Debug, Clone)]
pub struct ReadinessPoll {
    timeout: Duration,
    started_at: Duration,
    attempts: u32,
    last_status: Option<InstanceStatus>,
}

impl ReadinessPoll {
    /// Start a poll at clock reading `started_at`
    pub fn new(timeout: Duration, started_at: Duration) -> Self {
        Self {
            timeout,
            started_at,
            attempts: 0,
            last_status: None,
        }
    }

    /// `TimedOut` once the budget is spent, `Continue` otherwise
    pub fn check_deadline(&self, now: Duration) -> PollStep {
        if now.saturating_sub(self.started_at) < self.timeout {
            PollStep::Continue
        } else {
            PollStep::TimedOut
        }
    }

    /// Record one observed status
    pub fn observe(&mut self, status: InstanceStatus) -> PollStep {
        self.attempts += 1;
        self.last_status = Some(status);
        if status.is_ready() {
            PollStep::Ready
        } else if status.is_failure() {
            PollStep::Failed(status)
        } else {
            PollStep::Continue
        }
    }

    /// Polls made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Most recent status, if any poll happened
    pub fn last_status(&self) -> Option<InstanceStatus> {
        self.last_status
    }
}

/// Launches and tracks instances
#[derive(Clone)]
pub struct InstanceManager {
    api: ApiClient,
    clock: Arc<dyn Clock>,
}

impl InstanceManager {
    /// Create a manager
    pub fn new(api: ApiClient, clock: Arc<dyn Clock>) -> Self {
        Self { api, clock }
    }

    /// Launch instances and return their ids in vendor order.
    ///
    /// Fails with `EmptyLaunchResult` when the vendor accepts the request but
    /// returns no ids.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<Vec<InstanceId>> {
        info!(
            instance_type = %request.instance_type,
            region = %request.region,
            name = request.name.as_deref().unwrap_or("-"),
            quantity = request.quantity,
            "Launching instance"
        );

        let response = self.api.post(LAUNCH_ENDPOINT, serde_json::to_value(request)?).await?;
        let launched: Option<LaunchData> = data(response)?;
        let ids: Vec<InstanceId> = launched
            .map(|d| d.instance_ids)
            .unwrap_or_default()
            .into_iter()
            .map(InstanceId::new)
            .collect();

        if ids.is_empty() {
            return Err(FanoutError::EmptyLaunchResult);
        }

        info!(instance_ids = ?ids.iter().map(InstanceId::as_str).collect::<Vec<_>>(), "Launch accepted");
        Ok(ids)
    }

    /// Current state of one instance
    pub async fn get(&self, id: &InstanceId) -> Result<Instance> {
        debug!(instance_id = %id, "Fetching instance");
        let response = self.api.get(&instance_endpoint(id)).await?;
        let instance: VendorInstance = data(response)?;
        Ok(instance.into())
    }

    /// Every instance on the account
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let response = self.api.get(INSTANCES_ENDPOINT).await?;
        let instances: Option<Vec<VendorInstance>> = data(response)?;
        Ok(instances
            .unwrap_or_default()
            .into_iter()
            .map(Instance::from)
            .collect())
    }

    /// Instance types on offer, sorted by name
    pub async fn list_instance_types(&self) -> Result<Vec<InstanceTypeOffer>> {
        let response = self.api.get(INSTANCE_TYPES_ENDPOINT).await?;
        let offers: Option<HashMap<String, VendorOffer>> = data(response)?;

        let mut offers: Vec<InstanceTypeOffer> = offers
            .unwrap_or_default()
            .into_values()
            .map(|offer| InstanceTypeOffer {
                name: offer.instance_type.name,
                description: offer.instance_type.description,
                price_cents_per_hour: offer.instance_type.price_cents_per_hour,
                regions: offer
                    .regions_with_capacity_available
                    .into_iter()
                    .map(|r| r.name)
                    .collect(),
            })
            .collect();
        offers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(offers)
    }

    /// Poll until the instance is active.
    ///
    /// Returns `Ok(true)` once active, `Ok(false)` when `timeout` elapses
    /// first, and `FatalInstanceState` as soon as the instance is terminated
    /// or errored. Control-plane failures propagate.
    pub async fn wait_ready(
        &self,
        id: &InstanceId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        info!(instance_id = %id, timeout_secs = timeout.as_secs(), "Waiting for instance to become active");
        let mut poll = ReadinessPoll::new(timeout, self.clock.now());

        loop {
            if poll.check_deadline(self.clock.now()) == PollStep::TimedOut {
                warn!(
                    instance_id = %id,
                    attempts = poll.attempts(),
                    last_status = poll.last_status().map(|s| s.as_str()).unwrap_or("none"),
                    "Instance not active within timeout"
                );
                return Ok(false);
            }

            let instance = self.get(id).await?;
            info!(instance_id = %id, status = %instance.status, "Instance status");

            match poll.observe(instance.status) {
                PollStep::Ready => {
                    info!(instance_id = %id, ip = instance.ip.as_deref().unwrap_or("-"), "Instance is active");
                    return Ok(true);
                }
                PollStep::Failed(status) => {
                    return Err(FanoutError::FatalInstanceState {
                        instance_id: id.clone(),
                        status,
                    });
                }
                PollStep::Continue | PollStep::TimedOut => {
                    self.clock.sleep(poll_interval).await;
                }
            }
        }
    }

    /// Terminate instances
    pub async fn terminate(&self, ids: &[InstanceId]) -> Result<Value> {
        info!(count = ids.len(), "Terminating instances");
        self.api
            .post(TERMINATE_ENDPOINT, json!({ "instance_ids": ids }))
            .await
    }

    /// Restart instances
    pub async fn restart(&self, ids: &[InstanceId]) -> Result<Value> {
        info!(count = ids.len(), "Restarting instances");
        self.api
            .post(RESTART_ENDPOINT, json!({ "instance_ids": ids }))
            .await
    }
}
