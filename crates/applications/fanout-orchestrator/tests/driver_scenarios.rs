//! End-to-end driver runs against the scripted control plane

use fanout_core::{FanoutError, Job, JobStatus, Method};
use fanout_orchestrator::config::ApiConfig;
use fanout_orchestrator::driver::DRY_RUN_INSTANCE_ID;
use fanout_orchestrator::instance::LAUNCH_ENDPOINT;
use fanout_orchestrator::{
    ApiClient, BootstrapTemplate, Deployer, Driver, InstanceManager, JobOutcome, RunOptions,
};
use fanout_test_utils::{
    FakePackager, ManualClock, MockControlPlane, RecordingCopier, TEST_API_KEY, TEST_INSTANCE_TYPE,
    TEST_REGION, error_body, launch_body,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    plane: Arc<MockControlPlane>,
    clock: Arc<ManualClock>,
    copier: Arc<RecordingCopier>,
    packager: Arc<FakePackager>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let packager = Arc::new(FakePackager::new(dir.path()));
        Self {
            dir,
            plane: Arc::new(MockControlPlane::new()),
            clock: Arc::new(ManualClock::new()),
            copier: Arc::new(RecordingCopier::new()),
            packager,
        }
    }

    fn secret_path(&self) -> PathBuf {
        self.dir.path().join(".env")
    }

    fn results_path(&self) -> PathBuf {
        self.dir.path().join("launch_results.json")
    }

    fn write_secret(&self) {
        std::fs::write(self.secret_path(), "HUGGING_FACE_HUB_TOKEN=hf_test\n").unwrap();
    }

    fn options(&self) -> RunOptions {
        RunOptions::default()
            .with_placement(TEST_INSTANCE_TYPE, TEST_REGION)
            .with_ssh_key_names(vec!["test-key".to_string()])
            .with_ssh_key_file("test-key.pem")
            .with_secret_file(self.secret_path())
            .with_results_path(self.results_path())
    }

    fn driver(&self, options: RunOptions) -> Driver {
        self.driver_with_template(options, BootstrapTemplate::default())
    }

    fn driver_with_template(&self, options: RunOptions, template: BootstrapTemplate) -> Driver {
        let api = ApiClient::new(ApiConfig::new(TEST_API_KEY), self.plane.clone());
        let instances = InstanceManager::new(api, self.clock.clone());
        let deployer = Deployer::new(self.copier.clone(), &template);
        Driver::new(instances, self.packager.clone(), deployer, template, options)
    }

    fn saved_results(&self) -> Value {
        let text = std::fs::read_to_string(self.results_path()).unwrap();
        serde_json::from_str(&text).unwrap()
    }
}

fn jobs(names: &[&str]) -> Vec<Job> {
    names
        .iter()
        .map(|name| Job::new(*name, format!("run-{name}")))
        .collect()
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let harness = Harness::new();
    let driver = harness.driver(harness.options().with_dry_run(true));

    let result = driver.run(jobs(&["alpha", "beta"])).await.unwrap();

    assert_eq!(result.len(), 2);
    for (_, outcome) in result.iter() {
        assert!(outcome.is_success());
        assert_eq!(outcome.instance_ids()[0].as_str(), DRY_RUN_INSTANCE_ID);
    }
    assert!(harness.plane.requests().is_empty());
    assert_eq!(harness.packager.builds(), 0);
    assert!(harness.copier.copies().is_empty());
    assert!(!harness.results_path().exists());
}

#[tokio::test]
async fn test_missing_secret_aborts_before_any_launch() {
    let harness = Harness::new();
    let driver = harness.driver(harness.options());

    let err = driver.run(jobs(&["alpha", "beta"])).await.unwrap_err();

    assert!(matches!(err, FanoutError::MissingSecret(_)));
    assert_eq!(harness.plane.launch_count(), 0);
    assert!(harness.plane.requests().is_empty());
    assert!(!harness.results_path().exists());
}

#[tokio::test]
async fn test_one_failed_launch_does_not_stop_the_batch() {
    let harness = Harness::new();
    harness.write_secret();
    harness
        .plane
        .respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-a"]))
        .respond(
            Method::Post,
            LAUNCH_ENDPOINT,
            error_body(
                "instance-operations/launch/insufficient-capacity",
                "Not enough capacity to fulfill launch request.",
                Some("Try a different region"),
            ),
        );
    harness.plane.statuses("i-a", &["booting", "active"], Some("10.0.0.1"));

    let result = harness
        .driver(harness.options())
        .run(jobs(&["a", "b"]))
        .await
        .unwrap();

    assert_eq!(harness.plane.launch_count(), 2);

    match result.get("a").unwrap() {
        JobOutcome::Success { stage, instance_ids, ip, ssh_command } => {
            assert_eq!(*stage, JobStatus::Deployed);
            assert_eq!(instance_ids[0].as_str(), "i-a");
            assert_eq!(ip, "10.0.0.1");
            assert_eq!(ssh_command, "ssh -i test-key.pem ubuntu@10.0.0.1");
        }
        other => panic!("expected success for a, got {other:?}"),
    }

    let b = result.get("b").unwrap();
    assert_eq!(b.stage(), JobStatus::LaunchFailed);
    assert!(b.error().unwrap().contains("Not enough capacity to fulfill launch request."));
    assert!(b.instance_ids().is_empty());

    let copies = harness.copier.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].destination.host, "10.0.0.1");
    assert_eq!(copies[0].destination.path, "/home/ubuntu/code.tar.gz");
}

#[tokio::test]
async fn test_bundle_built_once_and_removed_after_results_saved() {
    let harness = Harness::new();
    harness.write_secret();
    harness
        .plane
        .respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-a"]))
        .respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-b"]));
    harness.plane.statuses("i-a", &["active"], Some("10.0.0.1"));
    harness.plane.statuses("i-b", &["active"], Some("10.0.0.2"));

    harness
        .driver(harness.options())
        .run(jobs(&["a", "b"]))
        .await
        .unwrap();

    assert_eq!(harness.packager.builds(), 1);
    assert!(!harness.packager.bundle_path().exists());

    let copies = harness.copier.copies();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|c| c.local == harness.packager.bundle_path()));

    let saved = harness.saved_results();
    let keys: Vec<&String> = saved.as_object().unwrap().keys().collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(saved["a"]["status"], "success");
    assert_eq!(saved["b"]["ip"], "10.0.0.2");
}

#[tokio::test]
async fn test_upload_failure_reports_address_for_manual_recovery() {
    let harness = Harness::new();
    harness.write_secret();
    harness.plane.respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-a"]));
    harness.plane.statuses("i-a", &["active"], Some("10.0.0.9"));
    harness.copier.fail_for("10.0.0.9");

    let result = harness
        .driver(harness.options())
        .run(jobs(&["alpha"]))
        .await
        .unwrap();

    match result.get("alpha").unwrap() {
        JobOutcome::Error { stage, error, instance_ids, ip, ssh_command } => {
            assert_eq!(*stage, JobStatus::DeployFailed);
            assert_eq!(ip.as_deref(), Some("10.0.0.9"));
            assert_eq!(ssh_command.as_deref(), Some("ssh -i test-key.pem ubuntu@10.0.0.9"));
            assert_eq!(instance_ids[0].as_str(), "i-a");
            assert!(error.contains("Connection refused"));
            assert!(error.contains("ubuntu@10.0.0.9:/home/ubuntu/code.tar.gz"));
        }
        other => panic!("expected deploy failure, got {other:?}"),
    }

    let saved = harness.saved_results();
    assert_eq!(saved["alpha"]["status"], "error");
    assert_eq!(saved["alpha"]["stage"], "deploy_failed");
    assert_eq!(saved["alpha"]["ip"], "10.0.0.9");
}

#[tokio::test]
async fn test_instance_that_never_boots_is_not_ready() {
    let harness = Harness::new();
    harness.write_secret();
    harness.plane.respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-slow"]));
    harness.plane.statuses("i-slow", &["booting"], None);

    let options = harness
        .options()
        .with_readiness(Duration::from_secs(30), Duration::from_secs(10));
    let result = harness.driver(options).run(jobs(&["alpha"])).await.unwrap();

    let outcome = result.get("alpha").unwrap();
    assert_eq!(outcome.stage(), JobStatus::NotReady);
    assert_eq!(outcome.instance_ids()[0].as_str(), "i-slow");
    assert_eq!(harness.plane.count(Method::Get, "/api/v1/instances/i-slow"), 3);
    assert!(harness.copier.copies().is_empty());
}

#[tokio::test]
async fn test_instance_entering_error_state_fails_launch() {
    let harness = Harness::new();
    harness.write_secret();
    harness.plane.respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-bad"]));
    harness.plane.statuses("i-bad", &["booting", "error"], None);

    let result = harness
        .driver(harness.options())
        .run(jobs(&["alpha"]))
        .await
        .unwrap();

    let outcome = result.get("alpha").unwrap();
    assert_eq!(outcome.stage(), JobStatus::LaunchFailed);
    assert!(outcome.error().unwrap().contains("i-bad"));
    assert_eq!(outcome.instance_ids()[0].as_str(), "i-bad");
    assert_eq!(harness.clock.sleeps().len(), 1);
}

#[tokio::test]
async fn test_launch_carries_job_script_and_name() {
    let harness = Harness::new();
    harness.write_secret();
    harness.plane.respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-a"]));
    harness.plane.statuses("i-a", &["active"], Some("10.0.0.1"));

    harness
        .driver(harness.options().with_attachment("shared-fs"))
        .run(jobs(&["alpha"]))
        .await
        .unwrap();

    let payload = &harness.plane.launch_payloads()[0];
    assert_eq!(payload["name"], "kto-alpha");
    assert_eq!(payload["instance_type_name"], TEST_INSTANCE_TYPE);
    assert_eq!(payload["file_system_names"][0], "shared-fs");

    let script = payload["user_data"].as_str().unwrap();
    assert!(script.contains("=== Starting job: alpha at $(date) ==="));
    assert!(script.contains("\nrun-alpha\n"));
}

#[tokio::test]
async fn test_concurrent_run_keeps_job_order() {
    let harness = Harness::new();
    harness.write_secret();
    for id in ["i-1", "i-2", "i-3"] {
        harness.plane.respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&[id]));
    }
    for (id, ip) in [("i-1", "10.0.0.1"), ("i-2", "10.0.0.2"), ("i-3", "10.0.0.3")] {
        harness.plane.statuses(id, &["active"], Some(ip));
    }

    let result = harness
        .driver(harness.options().with_concurrency(3))
        .run(jobs(&["gamma", "alpha", "beta"]))
        .await
        .unwrap();

    let names: Vec<&str> = result.iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["gamma", "alpha", "beta"]);
    assert_eq!(result.success_count(), 3);

    let text = std::fs::read_to_string(harness.results_path()).unwrap();
    let gamma = text.find("\"gamma\"").unwrap();
    let alpha = text.find("\"alpha\"").unwrap();
    let beta = text.find("\"beta\"").unwrap();
    assert!(gamma < alpha && alpha < beta);
}

#[tokio::test]
async fn test_script_looks_for_secret_where_bundle_put_it() {
    let mut harness = Harness::new();
    harness.packager =
        Arc::new(FakePackager::new(harness.dir.path()).with_secret_entry("secrets/prod.env"));
    harness.write_secret();
    harness.plane.respond(Method::Post, LAUNCH_ENDPOINT, launch_body(&["i-a"]));
    harness.plane.statuses("i-a", &["active"], Some("10.0.0.1"));

    harness
        .driver(harness.options())
        .run(jobs(&["alpha"]))
        .await
        .unwrap();

    let payload = &harness.plane.launch_payloads()[0];
    let script = payload["user_data"].as_str().unwrap();
    assert!(script.contains("if [ ! -f secrets/prod.env ]; then"));
    assert!(script.contains("source secrets/prod.env"));
    assert!(!script.contains("if [ ! -f .env ]"));
}

#[tokio::test]
async fn test_invalid_template_aborts_before_packaging() {
    let harness = Harness::new();
    harness.write_secret();
    let template = BootstrapTemplate {
        bundle_check_secs: 0,
        ..BootstrapTemplate::default()
    };

    let err = harness
        .driver_with_template(harness.options(), template)
        .run(jobs(&["alpha"]))
        .await
        .unwrap_err();

    assert!(matches!(err, FanoutError::Config(_)));
    assert_eq!(harness.packager.builds(), 0);
    assert_eq!(harness.plane.launch_count(), 0);
    assert!(!harness.results_path().exists());
}
