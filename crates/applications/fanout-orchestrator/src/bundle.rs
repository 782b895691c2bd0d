//! Bundle packaging
//!
//! Archives every git-tracked file plus the secret file (which is normally
//! untracked) under a single top-level directory.

use async_trait::async_trait;
use fanout_core::{Bundle, FanoutError, Packager, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Archive file name
pub const DEFAULT_BUNDLE_NAME: &str = "code.tar.gz";

/// Directory every archived path lives under
pub const DEFAULT_ARCHIVE_ROOT: &str = "manipulation_hackathon";

/// Split NUL-separated `git ls-files -z` output
pub fn parse_ls_files(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .split('\0')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// Arguments for `tar`, rooting every member under `archive_root`
pub fn tar_args(bundle_name: &str, archive_root: &str, files: &[String]) -> Vec<String> {
    let mut args = vec![
        "-czf".to_string(),
        bundle_name.to_string(),
        format!("--transform=s,^,{archive_root}/,"),
        "--".to_string(),
    ];
    args.extend(files.iter().cloned());
    args
}

/// Packages a git checkout with `git` and `tar`
#[derive(Debug, Clone)]
pub struct GitTarPackager {
    source_dir: PathBuf,
    bundle_name: String,
    archive_root: String,
}

impl GitTarPackager {
    /// Package the checkout at `source_dir`
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            bundle_name: DEFAULT_BUNDLE_NAME.to_string(),
            archive_root: DEFAULT_ARCHIVE_ROOT.to_string(),
        }
    }

    /// Override the archive file name
    pub fn with_bundle_name(mut self, name: impl Into<String>) -> Self {
        self.bundle_name = name.into();
        self
    }

    /// Override the top-level directory inside the archive
    pub fn with_archive_root(mut self, root: impl Into<String>) -> Self {
        self.archive_root = root.into();
        self
    }

    /// Where the archive is written
    pub fn bundle_path(&self) -> PathBuf {
        self.source_dir.join(&self.bundle_name)
    }

    /// Secret path as seen from the source directory. The secret must live
    /// inside it so it unpacks next to the code.
    fn relative_secret(&self, secret_file: &Path) -> Result<String> {
        let relative = if secret_file.is_absolute() {
            let source = self.source_dir.canonicalize()?;
            secret_file
                .strip_prefix(&source)
                .map_err(|_| {
                    FanoutError::packaging(format!(
                        "secret file {} is outside {}",
                        secret_file.display(),
                        source.display()
                    ))
                })?
                .to_path_buf()
        } else {
            secret_file.to_path_buf()
        };
        Ok(relative.to_string_lossy().into_owned())
    }

    async fn tracked_files(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["ls-files", "-z"])
            .current_dir(&self.source_dir)
            .output()
            .await
            .map_err(|e| FanoutError::packaging(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FanoutError::packaging(format!("git ls-files failed: {stderr}")));
        }
        Ok(parse_ls_files(&output.stdout))
    }
}

#[async_trait]
impl Packager for GitTarPackager {
    async fn build(&self, secret_file: &Path) -> Result<Bundle> {
        if !secret_file.exists() {
            return Err(FanoutError::MissingSecret(secret_file.to_path_buf()));
        }

        let mut files = self.tracked_files().await?;
        let secret = self.relative_secret(&secret_file.canonicalize()?)?;
        if !files.contains(&secret) {
            files.push(secret.clone());
        }
        debug!(files = files.len(), "Collected files for bundle");

        let output = Command::new("tar")
            .args(tar_args(&self.bundle_name, &self.archive_root, &files))
            .current_dir(&self.source_dir)
            .output()
            .await
            .map_err(|e| FanoutError::packaging(format!("failed to run tar: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FanoutError::packaging(format!("tar failed: {stderr}")));
        }

        let path = self.bundle_path();
        let size_bytes = std::fs::metadata(&path)?.len();
        let bundle = Bundle::new(path, size_bytes).with_secret_entry(secret);
        info!(
            path = %bundle.path().display(),
            size_mb = bundle.size_mb(),
            secret = bundle.secret_entry().unwrap_or_default(),
            "Created bundle"
        );
        Ok(bundle)
    }
}
