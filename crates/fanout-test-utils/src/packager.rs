//! Fake packager

use async_trait::async_trait;
use fanout_core::{Bundle, FanoutError, Packager, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Writes a tiny placeholder archive into `dir` instead of running git/tar.
#[derive(Debug)]
pub struct FakePackager {
    dir: PathBuf,
    secret_entry: Option<String>,
    builds: AtomicUsize,
}

impl FakePackager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            secret_entry: None,
            builds: AtomicUsize::new(0),
        }
    }

    /// Report the secret at `entry` inside the archive, as the real packager does
    pub fn with_secret_entry(mut self, entry: impl Into<String>) -> Self {
        self.secret_entry = Some(entry.into());
        self
    }

    /// Where the archive lands
    pub fn bundle_path(&self) -> PathBuf {
        self.dir.join("code.tar.gz")
    }

    /// Number of successful builds
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Packager for FakePackager {
    async fn build(&self, secret_file: &Path) -> Result<Bundle> {
        if !secret_file.exists() {
            return Err(FanoutError::MissingSecret(secret_file.to_path_buf()));
        }
        let path = self.bundle_path();
        let contents = b"fake bundle";
        std::fs::write(&path, contents)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        let bundle = Bundle::new(path, contents.len() as u64);
        Ok(match &self.secret_entry {
            Some(entry) => bundle.with_secret_entry(entry.as_str()),
            None => bundle,
        })
    }
}
