//! Job records and lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use ov_core::router::ExecutionTier;
use ov_core::{Error, Result};

use crate::spec::WorkflowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Killed)
    }

    /// `queued -> running -> terminal`, with `queued -> terminal` for jobs
    /// that never got a process.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Queued => next != JobState::Queued,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full job record. This is also the on-disk manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub workflow: WorkflowKind,
    pub team: String,
    pub state: JobState,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Agent the router picked; used when the worker reports no tasks
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub tier: Option<ExecutionTier>,
    pub command: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    /// Apply one lifecycle step. Terminal states are final.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition("job", self.state, next));
        }
        let now = Utc::now();
        match next {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            workflow: self.workflow,
            team: self.team.clone(),
            state: self.state,
            pid: self.pid,
            session_id: self.session_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// Summary returned by `start` and `list_all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub workflow: WorkflowKind,
    pub team: String,
    pub state: JobState,
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pushed on every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub session_id: Option<String>,
    pub state: JobState,
    pub exit_code: Option<i32>,
}

impl From<&JobStatus> for JobEvent {
    fn from(status: &JobStatus) -> Self {
        Self {
            job_id: status.id.clone(),
            session_id: status.session_id.clone(),
            state: status.state,
            exit_code: status.exit_code,
        }
    }
}

/// Context a caller attaches to a launch
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    /// Pre-allocated id; generated when absent
    pub job_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<i64>,
    pub tier: Option<ExecutionTier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> JobStatus {
        JobStatus {
            id: "j1".to_string(),
            workflow: WorkflowKind::Research,
            team: "research".to_string(),
            state: JobState::Queued,
            session_id: None,
            agent_id: None,
            tier: None,
            command: vec!["worker".to_string()],
            pid: None,
            exit_code: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_terminal_transition_happens_once() {
        let mut job = status();
        job.transition(JobState::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobState::Succeeded).unwrap();
        assert!(job.finished_at.is_some());

        let err = job.transition(JobState::Failed).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.transition(JobState::Running).is_err());
    }

    #[test]
    fn test_queued_can_fail_without_running() {
        let mut job = status();
        job.transition(JobState::Failed).unwrap();
        assert!(job.started_at.is_none());
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_manifest_format() {
        let job = status();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["workflow"], "research");
        let back: JobStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
