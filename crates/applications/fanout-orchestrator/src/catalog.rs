//! Job catalog
//!
//! Maps job names to shell commands. The built-in catalog covers the four
//! experiment configs; a JSON file can replace it.

use fanout_core::{FanoutError, Job, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bootstrap::{validate_command, validate_job_name};

/// Selector that expands to every job
pub const ALL_JOBS: &str = "all";

/// Built-in experiment configs as `(job, config path)`
const BUILTIN_CONFIGS: &[(&str, &str)] = &[
    ("therapy-talk", "therapy-talk/therapy.yaml"),
    ("booking-assistance", "booking-assistance/booking.yaml"),
    ("action-advice", "action-advice/action.yaml"),
    ("politics-questions", "politics-questions/political.yaml"),
];

/// Command for a built-in experiment config
pub fn experiment_command(config: &str) -> String {
    format!("python targeted_llm_manipulation/experiments/run_experiment.py --config={config} --all-gpus")
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name
    pub name: String,
    /// Shell command run on the instance
    pub command: String,
}

/// Ordered job-name to command mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCatalog {
    entries: Vec<JobSpec>,
}

impl JobCatalog {
    /// The built-in experiments
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_CONFIGS
                .iter()
                .map(|(name, config)| JobSpec {
                    name: name.to_string(),
                    command: experiment_command(config),
                })
                .collect(),
        }
    }

    /// Parse `[{"name": ..., "command": ...}, ...]`
    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: Vec<JobSpec> = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    /// Load a JSON catalog file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    fn from_entries(entries: Vec<JobSpec>) -> Result<Self> {
        if entries.is_empty() {
            return Err(FanoutError::config("job catalog is empty"));
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.name == ALL_JOBS {
                return Err(FanoutError::config(format!("'{ALL_JOBS}' is reserved")));
            }
            validate_job_name(&entry.name)?;
            validate_command(&entry.command)?;
            if entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(FanoutError::config(format!("duplicate job '{}'", entry.name)));
            }
        }
        Ok(Self { entries })
    }

    /// Job names in catalog order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Command for a job
    pub fn command(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.command.as_str())
    }

    /// Resolve selectors into jobs.
    ///
    /// `all` anywhere selects the whole catalog in catalog order. Otherwise
    /// jobs come back in selector order with repeats dropped. Unknown names
    /// fail with `UnknownJob`.
    pub fn select<S: AsRef<str>>(&self, selectors: &[S]) -> Result<Vec<Job>> {
        if selectors.is_empty() {
            return Err(FanoutError::config("no jobs selected"));
        }
        if selectors.iter().any(|s| s.as_ref() == ALL_JOBS) {
            return Ok(self
                .entries
                .iter()
                .map(|e| Job::new(&e.name, &e.command))
                .collect());
        }

        let mut jobs: Vec<Job> = Vec::new();
        for selector in selectors {
            let name = selector.as_ref();
            let command = self
                .command(name)
                .ok_or_else(|| FanoutError::UnknownJob(name.to_string()))?;
            if !jobs.iter().any(|j| j.name == name) {
                jobs.push(Job::new(name, command));
            }
        }
        Ok(jobs)
    }
}

impl Default for JobCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = JobCatalog::builtin();
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(
            names,
            vec!["therapy-talk", "booking-assistance", "action-advice", "politics-questions"]
        );
        assert_eq!(
            catalog.command("politics-questions"),
            Some(
                "python targeted_llm_manipulation/experiments/run_experiment.py --config=politics-questions/political.yaml --all-gpus"
            )
        );
    }

    #[test]
    fn test_select_all_and_named() {
        let catalog = JobCatalog::builtin();
        assert_eq!(catalog.select(&["all"]).unwrap().len(), 4);

        let jobs = catalog
            .select(&["action-advice", "therapy-talk", "action-advice"])
            .unwrap();
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["action-advice", "therapy-talk"]);
        assert!(jobs.iter().all(|j| j.instance_id.is_none()));
    }

    #[test]
    fn test_select_unknown_job() {
        let err = JobCatalog::builtin().select(&["nope"]).unwrap_err();
        assert!(matches!(err, FanoutError::UnknownJob(name) if name == "nope"));

        let none: [&str; 0] = [];
        assert!(JobCatalog::builtin().select(&none).is_err());
    }

    #[test]
    fn test_from_json_keeps_order_and_rejects_duplicates() {
        let catalog = JobCatalog::from_json_str(
            r#"[{"name": "b", "command": "echo b"}, {"name": "a", "command": "echo a"}]"#,
        )
        .unwrap();
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["b", "a"]);

        assert!(JobCatalog::from_json_str(
            r#"[{"name": "a", "command": "x"}, {"name": "a", "command": "y"}]"#
        )
        .is_err());
        assert!(JobCatalog::from_json_str(r#"[{"name": "all", "command": "x"}]"#).is_err());
        assert!(JobCatalog::from_json_str("[]").is_err());
    }

    #[test]
    fn test_from_json_rejects_names_and_commands_the_script_cannot_carry() {
        let err = JobCatalog::from_json_str(r#"[{"name": "alpha beta", "command": "echo a"}]"#)
            .unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));

        assert!(JobCatalog::from_json_str(r#"[{"name": "a;b", "command": "echo a"}]"#).is_err());
        assert!(JobCatalog::from_json_str(r#"[{"name": "alpha", "command": "  "}]"#).is_err());
        assert!(
            JobCatalog::from_json_str(r#"[{"name": "alpha", "command": "echo\nFANOUT_SETUP"}]"#)
                .is_err()
        );
        assert!(JobCatalog::from_json_str(r#"[{"name": "alpha.v2", "command": "echo a"}]"#).is_ok());
    }
}
