//! Fanout - one cloud GPU instance per job
//!
//! ## Usage
//!
//! ```bash
//! # Launch every built-in experiment
//! fanout launch --jobs all
//!
//! # Launch two jobs, print the plan only
//! fanout launch --jobs therapy-talk action-advice --dry-run
//!
//! # What can be rented right now
//! fanout launch --list-available
//!
//! # Inspect and clean up
//! fanout list-instances
//! fanout status <instance-id>
//! fanout terminate <instance-id>...
//! ```

use clap::{Parser, Subcommand};
use fanout_core::InstanceId;
use fanout_orchestrator::{
    ApiClient, ApiConfig, BootstrapTemplate, Deployer, Driver, GitTarPackager, InstanceManager,
    JobCatalog, JobOutcome, RunOptions, ScpCopier, TokioClock,
    config::{
        DEFAULT_ENV_FILE, DEFAULT_INSTANCE_TYPE, DEFAULT_POLL_INTERVAL_SECS,
        DEFAULT_READY_TIMEOUT_SECS, DEFAULT_REGION, DEFAULT_RESULTS_FILE, DEFAULT_SSH_KEY_FILE,
        DEFAULT_SSH_KEY_NAME,
    },
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fanout: launch one cloud GPU instance per job
#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Provision GPU instances, ship code and start jobs", long_about = None)]
struct Cli {
    /// Control-plane base URL
    #[arg(long, global = true, default_value = fanout_orchestrator::config::DEFAULT_API_BASE)]
    api_base: String,

    /// File holding LAMBDA_CLOUD_API_KEY (falls back to the environment)
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    credentials_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch jobs, one instance each
    Launch {
        /// Jobs to run, or "all"
        #[arg(long, num_args = 1.., default_values_t = vec!["all".to_string()])]
        jobs: Vec<String>,

        /// Instance type
        #[arg(long, default_value = DEFAULT_INSTANCE_TYPE)]
        instance_type: String,

        /// Region
        #[arg(long, default_value = DEFAULT_REGION)]
        region: String,

        /// SSH key name registered with the vendor (repeatable)
        #[arg(long = "ssh-key-name", default_values_t = vec![DEFAULT_SSH_KEY_NAME.to_string()])]
        ssh_key_names: Vec<String>,

        /// Private key used to upload the bundle
        #[arg(long, default_value = DEFAULT_SSH_KEY_FILE)]
        ssh_key_file: PathBuf,

        /// Secret file shipped inside the bundle
        #[arg(long, default_value = DEFAULT_ENV_FILE)]
        env_file: PathBuf,

        /// Where results are written
        #[arg(long, default_value = DEFAULT_RESULTS_FILE)]
        results_file: PathBuf,

        /// Git checkout to package
        #[arg(long, default_value = ".")]
        source_dir: PathBuf,

        /// JSON job catalog replacing the built-in one
        #[arg(long)]
        jobs_file: Option<PathBuf>,

        /// JSON bootstrap settings (missing keys keep their defaults)
        #[arg(long)]
        template_file: Option<PathBuf>,

        /// Persistent file system to attach (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<String>,

        /// Seconds to wait for each instance to become active
        #[arg(long, default_value_t = DEFAULT_READY_TIMEOUT_SECS)]
        ready_timeout: u64,

        /// Seconds between status polls
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
        poll_interval: u64,

        /// Jobs processed at once
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Print the plan without launching anything
        #[arg(long)]
        dry_run: bool,

        /// Print available instance types and exit
        #[arg(long)]
        list_available: bool,

        /// Print monitoring instructions for deployed jobs
        #[arg(long)]
        monitor: bool,
    },

    /// List instance types and regions with capacity
    ListTypes,

    /// List instances on the account
    ListInstances,

    /// Show one instance
    Status {
        /// Instance ID
        instance_id: String,
    },

    /// Terminate instances
    Terminate {
        /// Instance IDs
        #[arg(required = true)]
        instance_ids: Vec<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Restart instances
    Restart {
        /// Instance IDs
        #[arg(required = true)]
        instance_ids: Vec<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use std::io::Write;
    println!("⚠️  {prompt}");
    print!("Continue? [y/N]: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn instance_manager(api_base: &str, credentials_file: &Path) -> anyhow::Result<InstanceManager> {
    let config = ApiConfig::load(credentials_file)?.with_base_url(api_base);
    let api = ApiClient::http(config)?;
    Ok(InstanceManager::new(api, Arc::new(TokioClock::new())))
}

fn join_ids(ids: &[InstanceId]) -> String {
    ids.iter().map(InstanceId::as_str).collect::<Vec<_>>().join(", ")
}

fn ids(raw: Vec<String>) -> Vec<InstanceId> {
    raw.into_iter().map(InstanceId::new).collect()
}

async fn print_instance_types(manager: &InstanceManager) -> anyhow::Result<()> {
    let offers = manager.list_instance_types().await?;
    println!("{:<28} {:>10}  {:<40} REGIONS", "TYPE", "$/HOUR", "DESCRIPTION");
    for offer in offers {
        let regions = if offer.has_capacity() {
            offer.regions.join(", ")
        } else {
            "(no capacity)".to_string()
        };
        println!(
            "{:<28} {:>10.2}  {:<40} {}",
            offer.name,
            offer.price_per_hour(),
            offer.description,
            regions
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout=info,fanout_orchestrator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Launch {
            jobs,
            instance_type,
            region,
            ssh_key_names,
            ssh_key_file,
            env_file,
            results_file,
            source_dir,
            jobs_file,
            template_file,
            attachments,
            ready_timeout,
            poll_interval,
            concurrency,
            dry_run,
            list_available,
            monitor,
        } => {
            if list_available {
                let manager = instance_manager(&cli.api_base, &cli.credentials_file)?;
                return print_instance_types(&manager).await;
            }
            if poll_interval == 0 {
                anyhow::bail!("--poll-interval must be at least 1 second");
            }

            let catalog = match &jobs_file {
                Some(path) => JobCatalog::from_json_file(path)?,
                None => JobCatalog::builtin(),
            };
            let selected = catalog.select(&jobs)?;

            let template = match &template_file {
                Some(path) => BootstrapTemplate::from_json_file(path)?,
                None => BootstrapTemplate::default(),
            };

            let mut options = RunOptions::default()
                .with_placement(instance_type, region)
                .with_ssh_key_names(ssh_key_names)
                .with_ssh_key_file(ssh_key_file)
                .with_secret_file(env_file)
                .with_results_path(results_file)
                .with_readiness(
                    Duration::from_secs(ready_timeout),
                    Duration::from_secs(poll_interval),
                )
                .with_concurrency(concurrency)
                .with_dry_run(dry_run);
            for file_system in attachments {
                options = options.with_attachment(file_system);
            }

            info!("🚀 Launching {} job(s)", selected.len());
            info!("   Instance type: {}", options.instance_type);
            info!("   Region: {}", options.region);
            for job in &selected {
                info!("   • {} → {}", job.name, job.command);
            }

            let config = if dry_run {
                info!("🧪 Dry run: nothing will be packaged, launched or uploaded");
                ApiConfig::load(&cli.credentials_file)
                    .unwrap_or_else(|_| ApiConfig::new(String::new()))
            } else {
                ApiConfig::load(&cli.credentials_file)?
            };
            let api = ApiClient::http(config.with_base_url(&cli.api_base))?;
            let instances = InstanceManager::new(api, Arc::new(TokioClock::new()));
            let packager = GitTarPackager::new(source_dir)
                .with_bundle_name(template.bundle_name.clone())
                .with_archive_root(template.project_dir.clone());
            let deployer = Deployer::new(Arc::new(ScpCopier::new()), &template);

            let driver = Driver::new(
                instances,
                Arc::new(packager),
                deployer,
                template.clone(),
                options,
            );
            let result = driver.run(selected).await?;

            println!();
            println!("📋 Summary ({}/{} succeeded)", result.success_count(), result.len());
            for (name, outcome) in result.iter() {
                match outcome {
                    JobOutcome::Success {
                        stage,
                        instance_ids,
                        ip,
                        ssh_command,
                    } => {
                        println!("  ✅ {name}: {stage}");
                        println!("     Instances: {}", join_ids(instance_ids));
                        println!("     IP: {ip}");
                        if !ssh_command.is_empty() {
                            println!("     SSH: {ssh_command}");
                        }
                        if monitor && !dry_run {
                            for hint in template.monitoring_hints(ssh_command, name) {
                                println!("     {hint}");
                            }
                        }
                    }
                    JobOutcome::Error {
                        stage,
                        error,
                        instance_ids,
                        ip,
                        ssh_command,
                    } => {
                        println!("  ❌ {name}: {stage}");
                        println!("     Error: {error}");
                        if !instance_ids.is_empty() {
                            println!("     Instances: {}", join_ids(instance_ids));
                        }
                        if let Some(ip) = ip {
                            println!("     IP: {ip}");
                        }
                        if let Some(ssh_command) = ssh_command {
                            println!("     SSH: {ssh_command}");
                        }
                    }
                }
            }
            if !dry_run {
                println!("Results saved to {}", driver.options().results_path.display());
            }
        }

        Commands::ListTypes => {
            let manager = instance_manager(&cli.api_base, &cli.credentials_file)?;
            print_instance_types(&manager).await?;
        }

        Commands::ListInstances => {
            let manager = instance_manager(&cli.api_base, &cli.credentials_file)?;
            let instances = manager.list().await?;
            if instances.is_empty() {
                println!("No instances");
            }
            for instance in instances {
                println!(
                    "{:<36} {:<12} {:<24} {:<20} {:<16} {}",
                    instance.id.as_str(),
                    instance.status.as_str(),
                    instance.name.as_deref().unwrap_or("-"),
                    instance.instance_type.as_deref().unwrap_or("-"),
                    instance.ip.as_deref().unwrap_or("-"),
                    instance.region.as_deref().unwrap_or("-"),
                );
            }
        }

        Commands::Status { instance_id } => {
            let manager = instance_manager(&cli.api_base, &cli.credentials_file)?;
            let instance = manager.get(&InstanceId::new(instance_id)).await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }

        Commands::Terminate {
            instance_ids,
            force,
        } => {
            if !force
                && !confirm(&format!(
                    "This will terminate {} instance(s): {}",
                    instance_ids.len(),
                    instance_ids.join(", ")
                ))?
            {
                info!("Aborted");
                return Ok(());
            }
            let manager = instance_manager(&cli.api_base, &cli.credentials_file)?;
            info!("🗑️  Terminating {} instance(s)", instance_ids.len());
            manager.terminate(&ids(instance_ids)).await?;
            info!("✅ Termination requested");
        }

        Commands::Restart {
            instance_ids,
            force,
        } => {
            if !force
                && !confirm(&format!(
                    "This will restart {} instance(s): {}",
                    instance_ids.len(),
                    instance_ids.join(", ")
                ))?
            {
                info!("Aborted");
                return Ok(());
            }
            let manager = instance_manager(&cli.api_base, &cli.credentials_file)?;
            info!("🔄 Restarting {} instance(s)", instance_ids.len());
            manager.restart(&ids(instance_ids)).await?;
            info!("✅ Restart requested");
        }
    }

    Ok(())
}
