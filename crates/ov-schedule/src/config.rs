//! Maintenance schedule configuration
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! [[schedules]]
//! name = "reconcile"
//! cron = "0 * * * * *"
//! action = "reconcile_jobs"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Result, ScheduleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceAction {
    /// Settle adopted jobs and ingest finished ones
    ReconcileJobs,
    /// Actionable patterns plus command repetition scan
    DetectPatterns,
    /// Keep/kill/double-down pass over active experiments
    EvaluateExperiments,
}

impl fmt::Display for MaintenanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MaintenanceAction::ReconcileJobs => "reconcile_jobs",
            MaintenanceAction::DetectPatterns => "detect_patterns",
            MaintenanceAction::EvaluateExperiments => "evaluate_experiments",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub schedules: Vec<ScheduleTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub name: String,

    /// Six-field cron expression with seconds, e.g. "0 */15 * * * *"
    pub cron: String,

    pub action: MaintenanceAction,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleTask {
    pub fn new(name: &str, cron: &str, action: MaintenanceAction) -> Self {
        Self {
            name: name.to_string(),
            cron: cron.to_string(),
            action,
            enabled: true,
        }
    }
}

impl ScheduleConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScheduleError::ConfigLoad(format!(
                "schedule file {} not found",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path` when given, else the first default location that exists,
    /// else the built-in maintenance schedule.
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let paths = ["schedule.toml", "config/schedule.toml", ".overseer/schedule.toml"];
        for path in &paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::builtin())
    }

    /// Reconcile every minute, scan patterns hourly, evaluate experiments
    /// every six hours.
    pub fn builtin() -> Self {
        Self {
            schedules: vec![
                ScheduleTask::new("reconcile", "0 * * * * *", MaintenanceAction::ReconcileJobs),
                ScheduleTask::new("patterns", "0 0 * * * *", MaintenanceAction::DetectPatterns),
                ScheduleTask::new(
                    "experiments",
                    "0 30 */6 * * *",
                    MaintenanceAction::EvaluateExperiments,
                ),
            ],
        }
    }

    pub fn enabled_tasks(&self) -> Vec<&ScheduleTask> {
        self.schedules.iter().filter(|t| t.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[[schedules]]
name = "nightly experiments"
cron = "0 0 3 * * *"
action = "evaluate_experiments"

[[schedules]]
name = "patterns"
cron = "0 0 * * * *"
action = "detect_patterns"
enabled = false
"#;
        let config: ScheduleConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[0].action, MaintenanceAction::EvaluateExperiments);
        assert!(config.schedules[0].enabled);
        assert_eq!(config.enabled_tasks().len(), 1);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let toml = r#"
[[schedules]]
name = "x"
cron = "0 0 * * * *"
action = "send_email"
"#;
        assert!(toml::from_str::<ScheduleConfig>(toml).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = ScheduleConfig::load(Some("/no/such/schedule.toml")).unwrap_err();
        assert!(matches!(err, ScheduleError::ConfigLoad(_)));
    }

    #[test]
    fn test_builtin_covers_every_action() {
        let config = ScheduleConfig::builtin();
        for action in [
            MaintenanceAction::ReconcileJobs,
            MaintenanceAction::DetectPatterns,
            MaintenanceAction::EvaluateExperiments,
        ] {
            assert!(config.schedules.iter().any(|t| t.action == action));
        }
    }
}
