//! First-boot script generation
//!
//! The generated script runs once as root when the instance boots. It
//! prepares logs, then hands a setup script to the unprivileged remote user
//! which:
//!
//! 1. installs the Python runtime if it is missing
//! 2. waits for the uploaded bundle (bounded, with a heartbeat)
//! 3. unpacks it and checks the secret file made it across
//! 4. builds the project environment, logging installs to their own file
//! 5. loads secrets, logs in to the model hub, previews tracking credentials
//! 6. writes a runner script that banners, runs and logs the job
//! 7. starts the runner in a detached `screen` session
//!
//! Generation is pure: the same inputs always give the same text.

use fanout_core::{FanoutError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Delimiter of the embedded setup script
const SETUP_DELIMITER: &str = "FANOUT_SETUP";
/// Delimiter of the runner script embedded in the setup script
const RUNNER_DELIMITER: &str = "FANOUT_RUNNER";

/// Bootstrap settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapTemplate {
    /// Account the job runs as
    #[serde(default = "default_remote_user")]
    pub remote_user: String,

    /// Archive file name, uploaded into the user's home
    #[serde(default = "default_bundle_name")]
    pub bundle_name: String,

    /// Top-level directory inside the archive
    #[serde(default = "default_project_dir")]
    pub project_dir: String,

    /// Secret file name, relative to the project directory
    #[serde(default = "default_secret_file")]
    pub secret_file: String,

    /// Paths (relative to the project directory) that get a symlink to the secret file
    #[serde(default = "default_secret_links")]
    pub secret_links: Vec<String>,

    /// Miniconda installer
    #[serde(default = "default_installer_url")]
    pub installer_url: String,

    /// Channels whose terms of service are accepted non-interactively
    #[serde(default = "default_tos_channels")]
    pub tos_channels: Vec<String>,

    /// Conda environment name
    #[serde(default = "default_env_name")]
    pub env_name: String,

    /// Python version for the environment
    #[serde(default = "default_python_version")]
    pub python_version: String,

    /// Dependency install commands, run in order inside the environment
    #[serde(default = "default_install_steps")]
    pub install_steps: Vec<String>,

    /// Model-hub login, run after secrets are loaded
    #[serde(default = "default_login_command")]
    pub login_command: Option<String>,

    /// Secrets whose first characters are echoed as a load check
    #[serde(default = "default_preview_vars")]
    pub preview_vars: Vec<String>,

    /// Maximum wait for the bundle upload, seconds
    #[serde(default = "default_bundle_wait_secs")]
    pub bundle_wait_secs: u64,

    /// Delay between bundle checks, seconds
    #[serde(default = "default_bundle_check_secs")]
    pub bundle_check_secs: u64,

    /// Heartbeat period while waiting, seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Root-owned log capturing the whole first boot
    #[serde(default = "default_setup_log")]
    pub setup_log: String,

    /// Log for dependency installs
    #[serde(default = "default_install_log")]
    pub install_log: String,

    /// Detached session name
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

fn default_remote_user() -> String {
    "ubuntu".to_string()
}

fn default_bundle_name() -> String {
    "code.tar.gz".to_string()
}

fn default_project_dir() -> String {
    "manipulation_hackathon".to_string()
}

fn default_secret_file() -> String {
    ".env".to_string()
}

fn default_secret_links() -> Vec<String> {
    vec!["targeted_llm_manipulation/.env".to_string()]
}

fn default_installer_url() -> String {
    "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-x86_64.sh".to_string()
}

fn default_tos_channels() -> Vec<String> {
    vec![
        "https://repo.anaconda.com/pkgs/main".to_string(),
        "https://repo.anaconda.com/pkgs/r".to_string(),
    ]
}

fn default_env_name() -> String {
    "influence".to_string()
}

fn default_python_version() -> String {
    "3.11.9".to_string()
}

fn default_install_steps() -> Vec<String> {
    vec![
        "pip install -e .".to_string(),
        "pip install flash-attn==2.6.3 --no-build-isolation".to_string(),
    ]
}

fn default_login_command() -> Option<String> {
    Some("huggingface-cli login --token \"$HUGGING_FACE_HUB_TOKEN\"".to_string())
}

fn default_preview_vars() -> Vec<String> {
    vec!["WANDB_API_KEY".to_string()]
}

fn default_bundle_wait_secs() -> u64 {
    600
}

fn default_bundle_check_secs() -> u64 {
    5
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_setup_log() -> String {
    "/var/log/experiment-setup.log".to_string()
}

fn default_install_log() -> String {
    "/var/log/pip-install.log".to_string()
}

fn default_session_name() -> String {
    "experiment".to_string()
}

impl Default for BootstrapTemplate {
    fn default() -> Self {
        Self {
            remote_user: default_remote_user(),
            bundle_name: default_bundle_name(),
            project_dir: default_project_dir(),
            secret_file: default_secret_file(),
            secret_links: default_secret_links(),
            installer_url: default_installer_url(),
            tos_channels: default_tos_channels(),
            env_name: default_env_name(),
            python_version: default_python_version(),
            install_steps: default_install_steps(),
            login_command: default_login_command(),
            preview_vars: default_preview_vars(),
            bundle_wait_secs: default_bundle_wait_secs(),
            bundle_check_secs: default_bundle_check_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            setup_log: default_setup_log(),
            install_log: default_install_log(),
            session_name: default_session_name(),
        }
    }
}

/// Job names end up in file names and banners
pub(crate) fn validate_job_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FanoutError::config(format!(
            "invalid job name '{name}': use letters, digits, '-', '_' or '.'"
        )))
    }
}

/// A line equal to a heredoc delimiter would end the embedded script early
pub(crate) fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(FanoutError::config("job command is empty"));
    }
    let clash = command
        .lines()
        .any(|l| matches!(l.trim(), SETUP_DELIMITER | RUNNER_DELIMITER));
    if clash {
        return Err(FanoutError::config(format!(
            "job command may not contain a line reading {SETUP_DELIMITER} or {RUNNER_DELIMITER}"
        )));
    }
    Ok(())
}

/// `../` for every directory level of `link`, then the secret name
fn link_target(link: &str, secret_file: &str) -> String {
    let depth = link.split('/').filter(|p| !p.is_empty()).count().saturating_sub(1);
    format!("{}{}", "../".repeat(depth), secret_file)
}

fn push(script: &mut String, line: &str) {
    script.push_str(line);
    script.push('\n');
}

impl BootstrapTemplate {
    /// Home directory of the remote user
    pub fn home(&self) -> String {
        format!("/home/{}", self.remote_user)
    }

    /// Where the bundle must be uploaded
    pub fn bundle_path(&self) -> String {
        format!("{}/{}", self.home(), self.bundle_name)
    }

    /// Unpacked project directory
    pub fn project_path(&self) -> String {
        format!("{}/{}", self.home(), self.project_dir)
    }

    /// Runtime install location
    pub fn conda_root(&self) -> String {
        format!("{}/miniconda", self.home())
    }

    /// Runner script written on first boot
    pub fn runner_path(&self) -> String {
        format!("{}/run_experiment.sh", self.home())
    }

    /// Per-job output log
    pub fn output_log(&self, job_name: &str) -> String {
        format!("{}/{}-output.log", self.home(), job_name)
    }

    fn setup_path(&self) -> String {
        format!("{}/fanout-setup.sh", self.home())
    }

    /// Load a template from JSON, unset fields taking their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let template: Self = serde_json::from_str(&contents)?;
        template.validate()?;
        Ok(template)
    }

    /// Point the script at the secret file as it sits in the bundle
    pub fn with_secret_file(mut self, secret_file: impl Into<String>) -> Self {
        self.secret_file = secret_file.into();
        self
    }

    /// Check the bundle wait terminates and its heartbeat lands on a check.
    pub fn validate(&self) -> Result<()> {
        if self.bundle_check_secs == 0 {
            return Err(FanoutError::config("bundle_check_secs must be at least 1"));
        }
        if self.bundle_wait_secs < self.bundle_check_secs {
            return Err(FanoutError::config(format!(
                "bundle_wait_secs ({}) is shorter than bundle_check_secs ({})",
                self.bundle_wait_secs, self.bundle_check_secs
            )));
        }
        if self.heartbeat_secs == 0 || self.heartbeat_secs % self.bundle_check_secs != 0 {
            return Err(FanoutError::config(format!(
                "heartbeat_secs ({}) must be a positive multiple of bundle_check_secs ({})",
                self.heartbeat_secs, self.bundle_check_secs
            )));
        }
        if self.secret_file.trim().is_empty() {
            return Err(FanoutError::config("secret_file is empty"));
        }
        Ok(())
    }

    /// Render the first-boot script for one job.
    ///
    /// Fails with `Config` when the template does not pass [`validate`], the
    /// job name has characters outside `[A-Za-z0-9._-]` or the command is
    /// empty or contains a line that would terminate an embedded heredoc.
    ///
    /// [`validate`]: Self::validate
    pub fn generate(&self, job_name: &str, command: &str) -> Result<String> {
        self.validate()?;
        validate_job_name(job_name)?;
        validate_command(command)?;

        let mut script = String::new();
        self.write_preamble(&mut script, job_name);
        push(&mut script, &format!("cat > {} <<'{SETUP_DELIMITER}'", self.setup_path()));
        self.write_setup(&mut script, job_name, command);
        push(&mut script, SETUP_DELIMITER);
        self.write_handoff(&mut script, job_name);
        Ok(script)
    }

    fn write_preamble(&self, s: &mut String, job_name: &str) {
        let user = &self.remote_user;
        push(s, "#!/bin/bash");
        push(s, &format!("# First-boot setup for job {job_name}"));
        push(s, "set -euo pipefail");
        push(s, "");
        push(s, &format!("touch {} {}", self.setup_log, self.install_log));
        push(s, &format!("chown {user}:{user} {} {}", self.setup_log, self.install_log));
        push(s, &format!("exec > >(tee -a {}) 2>&1", self.setup_log));
        push(s, "");
        push(s, &format!("echo \"=== Starting setup for job {job_name} at $(date) ===\""));
        push(s, "if ! command -v screen >/dev/null 2>&1; then");
        push(s, "    apt-get update -y && apt-get install -y screen");
        push(s, "fi");
        push(s, "");
    }

    fn write_setup(&self, s: &mut String, job_name: &str, command: &str) {
        let conda = self.conda_root();
        let bundle = self.bundle_path();

        push(s, "#!/bin/bash");
        push(s, "set -eo pipefail");
        push(s, &format!("cd {}", self.home()));
        push(s, "");

        push(s, "# Runtime");
        push(s, &format!("if [ ! -x {conda}/bin/conda ]; then"));
        push(s, "    echo \"Installing Miniconda...\"");
        push(s, &format!("    wget -q {} -O miniconda.sh", self.installer_url));
        push(s, &format!("    bash miniconda.sh -b -u -p {conda}"));
        push(s, "    rm -f miniconda.sh");
        push(s, &format!("    {conda}/bin/conda init bash"));
        push(s, "else");
        push(s, &format!("    echo \"Miniconda already installed at {conda}\""));
        push(s, "fi");
        push(s, &format!("eval \"$({conda}/bin/conda shell.bash hook)\""));
        for channel in &self.tos_channels {
            push(s, &format!("conda tos accept --override-channels --channel {channel} || true"));
        }
        push(s, "");

        push(s, "# Bundle");
        push(s, &format!("echo \"Waiting for {} upload...\"", self.bundle_name));
        push(s, &format!("max_wait={}", self.bundle_wait_secs));
        push(s, "waited=0");
        push(s, &format!("while [ ! -f {bundle} ] && [ \"$waited\" -lt \"$max_wait\" ]; do"));
        push(s, &format!("    sleep {}", self.bundle_check_secs));
        push(s, &format!("    waited=$((waited + {}))", self.bundle_check_secs));
        push(s, &format!("    if [ $((waited % {})) -eq 0 ]; then", self.heartbeat_secs));
        push(s, &format!("        echo \"Still waiting for {}... (${{waited}}s elapsed)\"", self.bundle_name));
        push(s, "    fi");
        push(s, "done");
        push(s, &format!("if [ ! -f {bundle} ]; then"));
        push(s, &format!("    echo \"ERROR: {} not found after ${{max_wait}} seconds\"", self.bundle_name));
        push(
            s,
            &format!(
                "    echo \"Upload it with: scp -i <key> {} {}@<instance-ip>:{bundle}\"",
                self.bundle_name, self.remote_user
            ),
        );
        push(s, "    exit 1");
        push(s, "fi");
        push(s, "echo \"Extracting bundle...\"");
        push(s, &format!("tar -xzf {bundle} -C {}", self.home()));
        push(s, &format!("rm -f {bundle}"));
        push(s, &format!("cd {}", self.project_path()));
        push(s, &format!("if [ ! -f {} ]; then", self.secret_file));
        push(s, &format!("    echo \"ERROR: {} not found in bundle\"", self.secret_file));
        push(s, "    exit 1");
        push(s, "fi");
        push(s, &format!("echo \"{} found in bundle\"", self.secret_file));
        for link in &self.secret_links {
            push(s, &format!("ln -sf {} {link}", link_target(link, &self.secret_file)));
        }
        push(s, "");

        push(s, "# Environment");
        push(s, &format!("if conda env list | grep -qE '^{}[[:space:]]'; then", self.env_name));
        push(s, &format!("    echo \"Conda environment {} already exists\"", self.env_name));
        push(s, "else");
        push(s, &format!("    conda create -n {} python={} -y", self.env_name, self.python_version));
        push(s, "fi");
        push(s, &format!("conda activate {}", self.env_name));
        push(s, &format!("echo \"Installing dependencies (log: {})...\"", self.install_log));
        for step in &self.install_steps {
            push(s, &format!("echo \"+ {}\"", step.replace('"', "\\\"")));
            push(s, &format!("{step} 2>&1 | tee -a {}", self.install_log));
        }
        push(s, "");

        push(s, "# Secrets");
        push(s, "set -a");
        push(s, &format!("source {}", self.secret_file));
        push(s, "set +a");
        if let Some(login) = &self.login_command {
            push(s, "echo \"Logging in to the model hub...\"");
            push(s, login);
        }
        for var in &self.preview_vars {
            push(s, &format!("preview=\"${{{var}:-}}\""));
            push(s, &format!("echo \"{var} loaded: ${{preview:0:4}}...\""));
        }
        push(s, "");

        push(s, "# Runner");
        push(s, &format!("cat > {} <<'{RUNNER_DELIMITER}'", self.runner_path()));
        self.write_runner(s, job_name, command);
        push(s, RUNNER_DELIMITER);
        push(s, &format!("chmod +x {}", self.runner_path()));
        push(s, "");

        push(s, &format!("echo \"=== Launching job {job_name} in screen session {} ===\"", self.session_name));
        push(s, &format!("screen -dmS {} {}", self.session_name, self.runner_path()));
        push(s, &format!("echo \"Attach:   screen -r {}\"", self.session_name));
        push(s, &format!("echo \"Job log:  tail -f {}\"", self.output_log(job_name)));
        push(s, &format!("echo \"Setup log: tail -f {}\"", self.setup_log));
    }

    fn write_runner(&self, s: &mut String, job_name: &str, command: &str) {
        push(s, "#!/bin/bash");
        push(s, "set -o pipefail");
        push(s, &format!("eval \"$({}/bin/conda shell.bash hook)\"", self.conda_root()));
        push(s, &format!("conda activate {}", self.env_name));
        push(s, &format!("cd {}", self.project_path()));
        push(s, "set -a");
        push(s, &format!("source {}", self.secret_file));
        push(s, "set +a");
        push(s, &format!("LOG={}", self.output_log(job_name)));
        push(s, &format!("echo \"=== Starting job: {job_name} at $(date) ===\" | tee \"$LOG\""));
        push(s, "(");
        push(s, command);
        push(s, ") 2>&1 | tee -a \"$LOG\"");
        push(s, "exit_code=${PIPESTATUS[0]}");
        push(s, "if [ \"$exit_code\" -eq 0 ]; then");
        push(s, &format!("    echo \"=== Job {job_name} completed successfully at $(date) ===\" | tee -a \"$LOG\""));
        push(s, "else");
        push(
            s,
            &format!("    echo \"=== Job {job_name} FAILED with exit code $exit_code at $(date) ===\" | tee -a \"$LOG\""),
        );
        push(s, "fi");
        push(s, "exit \"$exit_code\"");
    }

    fn write_handoff(&self, s: &mut String, job_name: &str) {
        let user = &self.remote_user;
        let setup = self.setup_path();
        push(s, "");
        push(s, &format!("chown {user}:{user} {setup}"));
        push(s, &format!("chmod +x {setup}"));
        push(s, &format!("su - {user} -c \"bash {setup}\""));
        push(s, &format!("echo \"=== Setup for job {job_name} finished at $(date) ===\""));
    }

    /// How to follow a job once it is running
    pub fn monitoring_hints(&self, ssh_command: &str, job_name: &str) -> Vec<String> {
        vec![
            format!("Connect:      {ssh_command}"),
            format!("Setup log:    tail -f {}", self.setup_log),
            format!("Job session:  screen -r {}", self.session_name),
            format!("Job log:      tail -f {}", self.output_log(job_name)),
        ]
    }
}
