//! Credentials and run options
//!
//! Credentials come from a dotenv-style file (`KEY=value` lines) with the
//! process environment as a fallback. Run options carry every knob the
//! driver needs; the CLI fills them from flags.

use fanout_core::{FanoutError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Vendor API endpoint
pub const DEFAULT_API_BASE: &str = "https://cloud.lambda.ai";

/// Variable holding the vendor API key
pub const API_KEY_VAR: &str = "LAMBDA_CLOUD_API_KEY";

/// Default credentials/secret file
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Default results file
pub const DEFAULT_RESULTS_FILE: &str = "launch_results.json";

/// Default GPU type
pub const DEFAULT_INSTANCE_TYPE: &str = "gpu_1x_h100_sxm5";

/// Default region
pub const DEFAULT_REGION: &str = "us-south-2";

/// Default SSH key registered with the vendor
pub const DEFAULT_SSH_KEY_NAME: &str = "aidan";

/// Default private key used for copies
pub const DEFAULT_SSH_KEY_FILE: &str = "./aidan.pem";

/// Instance names are `<prefix><job>`
pub const DEFAULT_INSTANCE_PREFIX: &str = "kto-";

/// Readiness timeout used by the driver, in seconds
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 600;

/// Poll interval used by the driver, in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Parse `KEY=value` lines.
///
/// Blank lines and `#` comments are skipped, an optional `export ` prefix is
/// dropped and one layer of matching single or double quotes is stripped from
/// values.
pub fn parse_env(contents: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Read and parse an env file
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_env(&contents))
}

/// Control-plane connection settings
#[derive(Clone)]
pub struct ApiConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    api_key: String,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ApiConfig {
    /// Create a config for the default endpoint
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Override the endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// API key used for basic auth
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Read the key from an env file
    pub fn from_env_file(path: &Path) -> Result<Self> {
        let vars = read_env_file(path).map_err(|e| {
            FanoutError::config(format!(
                "cannot read credentials file {}: {e}",
                path.display()
            ))
        })?;
        match vars.get(API_KEY_VAR) {
            Some(key) if !key.is_empty() => Ok(Self::new(key.clone())),
            _ => Err(FanoutError::config(format!(
                "{API_KEY_VAR} not set in {}",
                path.display()
            ))),
        }
    }

    /// Read the key from the process environment
    pub fn from_env() -> Result<Self> {
        match std::env::var(API_KEY_VAR) {
            Ok(key) if !key.is_empty() => Ok(Self::new(key)),
            _ => Err(FanoutError::config(format!(
                "{API_KEY_VAR} not found in environment"
            ))),
        }
    }

    /// File first when it exists, then the environment.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!(path = %path.display(), "Loading credentials from file");
            Self::from_env_file(path)
        } else {
            debug!(path = %path.display(), "Credentials file absent, using environment");
            Self::from_env()
        }
    }
}

/// Settings for one orchestration run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Vendor instance type
    pub instance_type: String,
    /// Vendor region
    pub region: String,
    /// SSH key names registered with the vendor
    pub ssh_key_names: Vec<String>,
    /// Private key file used for copies and printed ssh commands
    pub ssh_key_file: PathBuf,
    /// Secret file that must ship inside the bundle
    pub secret_file: PathBuf,
    /// Where the results document is written
    pub results_path: PathBuf,
    /// Persistent file systems attached to every instance
    pub attachments: Vec<String>,
    /// Prefix for vendor-side instance names
    pub instance_prefix: String,
    /// Print the plan, touch nothing
    pub dry_run: bool,
    /// Readiness timeout
    pub ready_timeout: Duration,
    /// Readiness poll interval
    pub poll_interval: Duration,
    /// Jobs processed at once
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            region: DEFAULT_REGION.to_string(),
            ssh_key_names: vec![DEFAULT_SSH_KEY_NAME.to_string()],
            ssh_key_file: PathBuf::from(DEFAULT_SSH_KEY_FILE),
            secret_file: PathBuf::from(DEFAULT_ENV_FILE),
            results_path: PathBuf::from(DEFAULT_RESULTS_FILE),
            attachments: Vec::new(),
            instance_prefix: DEFAULT_INSTANCE_PREFIX.to_string(),
            dry_run: false,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            concurrency: 1,
        }
    }
}

impl RunOptions {
    /// Set instance type and region
    pub fn with_placement(mut self, instance_type: impl Into<String>, region: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self.region = region.into();
        self
    }

    /// Set SSH key names
    pub fn with_ssh_key_names(mut self, names: Vec<String>) -> Self {
        self.ssh_key_names = names;
        self
    }

    /// Set the private key file
    pub fn with_ssh_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_file = path.into();
        self
    }

    /// Set the secret file
    pub fn with_secret_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_file = path.into();
        self
    }

    /// Set the results path
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = path.into();
        self
    }

    /// Attach a persistent file system to every instance
    pub fn with_attachment(mut self, file_system: impl Into<String>) -> Self {
        self.attachments.push(file_system.into());
        self
    }

    /// Enable or disable dry run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set readiness timeout and poll interval
    pub fn with_readiness(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.ready_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Set how many jobs run at once (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Vendor-side instance name for a job
    pub fn instance_name(&self, job_name: &str) -> String {
        format!("{}{}", self.instance_prefix, job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_env_handles_comments_quotes_and_export() {
        let vars = parse_env(
            "# credentials\n\
             LAMBDA_CLOUD_API_KEY=\"secret_abc\"\n\
             export WANDB_API_KEY='wandb123'\n\
             \n\
             EMPTY=\n\
             URL=https://example.com/?a=b\n\
             not a pair\n",
        );
        assert_eq!(vars["LAMBDA_CLOUD_API_KEY"], "secret_abc");
        assert_eq!(vars["WANDB_API_KEY"], "wandb123");
        assert_eq!(vars["EMPTY"], "");
        assert_eq!(vars["URL"], "https://example.com/?a=b");
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn test_api_config_from_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "LAMBDA_CLOUD_API_KEY=secret_from_file").unwrap();

        let config = ApiConfig::from_env_file(file.path()).unwrap();
        assert_eq!(config.api_key(), "secret_from_file");
        assert_eq!(config.base_url, DEFAULT_API_BASE);
    }

    #[test]
    fn test_api_config_missing_key_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "OTHER=1").unwrap();

        let err = ApiConfig::from_env_file(file.path()).unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));
        assert!(err.to_string().contains(API_KEY_VAR));
    }

    #[test]
    fn test_api_config_debug_redacts_key() {
        let config = ApiConfig::new("secret_do_not_print").with_base_url("http://localhost:8080/");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret_do_not_print"));
        assert_eq!(config.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_run_options_defaults() {
        let options = RunOptions::default();
        assert_eq!(options.instance_type, "gpu_1x_h100_sxm5");
        assert_eq!(options.region, "us-south-2");
        assert_eq!(options.ready_timeout, Duration::from_secs(600));
        assert_eq!(options.poll_interval, Duration::from_secs(10));
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.instance_name("therapy-talk"), "kto-therapy-talk");
        assert_eq!(RunOptions::default().with_concurrency(0).concurrency, 1);
    }
}
