//! Reconciliation: the only path from finished jobs into store rows
//!
//! A finished job's artifact (or, without one, its exit state) becomes task
//! rows, a terminal session, rewards and session metrics. Running it twice
//! for the same job is harmless: a session that is already terminal is
//! left alone.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ov_core::learning::SessionAnalysis;
use ov_core::router::{ExecutionTier, UsageInput};
use ov_core::store::{
    NewTask, Session, SessionOutcome, SessionStatus, Store, Task, TaskOutcome, TaskStatus,
};
use ov_core::{LearningController, Result, TaskRouter};

use crate::job::{JobState, JobStatus};

/// Report a worker may leave at `OVERSEER_ARTIFACT_PATH`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerArtifact {
    #[serde(default)]
    pub status: Option<ArtifactStatus>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub iterations: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<ArtifactTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Completed,
    Failed,
    Blocked,
}

impl From<ArtifactStatus> for SessionStatus {
    fn from(status: ArtifactStatus) -> Self {
        match status {
            ArtifactStatus::Completed => SessionStatus::Completed,
            ArtifactStatus::Failed => SessionStatus::Failed,
            ArtifactStatus::Blocked => SessionStatus::Blocked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactTask {
    /// Agent name; unknown names fall back to the routed agent
    pub agent: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub tier: Option<ExecutionTier>,
    #[serde(default)]
    pub retry_count: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub usage: Option<ArtifactUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArtifactUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Read a worker artifact. A missing file is None; a malformed one is logged
/// and treated as missing.
pub fn read_artifact(path: &Path) -> Result<Option<WorkerArtifact>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(artifact) => Ok(Some(artifact)),
        Err(e) => {
            warn!(path = %path.display(), "Ignoring malformed worker artifact: {}", e);
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Job still running
    Pending { job_id: String },
    /// No session row references the job
    NoSession { job_id: String },
    AlreadyReconciled { job_id: String, session_id: String },
    Reconciled(ReconcileReport),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub job_id: String,
    pub session_id: String,
    pub session_status: SessionStatus,
    pub tasks: usize,
    /// Sum of task and session rewards issued
    pub rewards: i64,
    pub analysis: SessionAnalysis,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    router: TaskRouter,
    learning: LearningController,
}

impl Reconciler {
    pub fn new(router: TaskRouter, learning: LearningController) -> Self {
        Self { router, learning }
    }

    pub fn reconcile(
        &self,
        store: &Store,
        job: &JobStatus,
        artifact: Option<&WorkerArtifact>,
    ) -> Result<ReconcileOutcome> {
        if !job.state.is_terminal() {
            return Ok(ReconcileOutcome::Pending {
                job_id: job.id.clone(),
            });
        }

        let session = match job.session_id.as_deref() {
            Some(id) => store.get_session(id)?,
            None => store.get_session_by_job(&job.id)?,
        };
        let Some(mut session) = session else {
            debug!(job_id = %job.id, "No session for job, nothing to reconcile");
            return Ok(ReconcileOutcome::NoSession {
                job_id: job.id.clone(),
            });
        };
        if session.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyReconciled {
                job_id: job.id.clone(),
                session_id: session.id,
            });
        }
        if session.status == SessionStatus::Pending {
            session = store.start_session(&session.id)?;
        }

        let mut rewards = 0;
        let existing = store.list_tasks_for_session(&session.id)?;
        let tasks = if existing.is_empty() {
            let (tasks, earned) = self.ingest_tasks(store, job, &session, artifact)?;
            rewards += earned;
            tasks
        } else {
            debug!(session_id = %session.id, "Tasks already ingested");
            existing.len()
        };

        let status = match job.state {
            JobState::Succeeded => artifact
                .and_then(|a| a.status)
                .map(SessionStatus::from)
                .unwrap_or(SessionStatus::Completed),
            JobState::Killed => SessionStatus::Blocked,
            _ => SessionStatus::Failed,
        };
        if let Some(iterations) = artifact.and_then(|a| a.iterations) {
            store.set_session_iterations(&session.id, iterations)?;
        }

        let outcome = SessionOutcome {
            status,
            pr_url: artifact.and_then(|a| a.pr_url.clone()),
            branch_name: artifact.and_then(|a| a.branch_name.clone()),
        };
        let finished = store.finish_session(&session.id, &outcome)?;
        if let Some(reward) = self.learning.reward_session(store, &finished)? {
            rewards += reward.amount;
        }
        let analysis = self.learning.analyze_session(store, &finished.id)?;

        info!(
            job_id = %job.id,
            session_id = %finished.id,
            status = %status,
            tasks,
            rewards,
            "Job reconciled"
        );
        Ok(ReconcileOutcome::Reconciled(ReconcileReport {
            job_id: job.id.clone(),
            session_id: finished.id,
            session_status: status,
            tasks,
            rewards,
            analysis,
        }))
    }

    /// Create task rows from the artifact, or one task mirroring the job.
    fn ingest_tasks(
        &self,
        store: &Store,
        job: &JobStatus,
        session: &Session,
        artifact: Option<&WorkerArtifact>,
    ) -> Result<(usize, i64)> {
        let mut count = 0;
        let mut rewards = 0;

        let planned = match artifact {
            Some(artifact) => self.plan_tasks(store, job, artifact)?,
            None => Vec::new(),
        };
        if !planned.is_empty() {
            for (reported, agent_id) in planned {
                let outcome = match reported.status {
                    TaskStatus::Completed => Some(TaskOutcome::completed()),
                    TaskStatus::Failed => Some(TaskOutcome::failed(
                        reported
                            .error
                            .clone()
                            .unwrap_or_else(|| "worker reported failure".to_string()),
                    )),
                    _ => None,
                }
                .map(|o| match reported.duration_secs {
                    Some(secs) => o.with_duration(secs),
                    None => o,
                });

                let task = self.record_task(
                    store,
                    NewTask {
                        session_id: session.id.clone(),
                        agent_id,
                        description: reported.description.clone(),
                        tier_used: reported.tier.or(job.tier),
                    },
                    reported.status,
                    reported.retry_count.unwrap_or(0),
                    reported.error.as_deref(),
                    outcome,
                )?;
                if let (Some(usage), Some(tier)) = (reported.usage, task.tier_used) {
                    self.router.record_usage(
                        store,
                        &UsageInput {
                            task_id: Some(task.id.clone()),
                            agent_id: Some(agent_id),
                            tier,
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            duration_ms: usage.duration_ms,
                        },
                    )?;
                }
                if let Some(reward) = self.learning.reward_task(store, &task)? {
                    rewards += reward.amount;
                }
                count += 1;
            }
            return Ok((count, rewards));
        }

        let Some(agent_id) = job.agent_id else {
            warn!(job_id = %job.id, "Job has no routed agent, no task recorded");
            return Ok((0, 0));
        };
        let description = session
            .priority_input
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("{} job {}", job.workflow, job.id));
        let duration = match (job.started_at, job.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as f64 / 1000.0),
            _ => None,
        };
        let mut outcome = match job.state {
            JobState::Succeeded => TaskOutcome::completed(),
            JobState::Killed => TaskOutcome::failed("stopped by operator"),
            _ => TaskOutcome::failed(job.error.clone().unwrap_or_else(|| "worker failed".to_string())),
        };
        if let Some(secs) = duration {
            outcome = outcome.with_duration(secs);
        }
        let status = outcome.status;
        let task = self.record_task(
            store,
            NewTask {
                session_id: session.id.clone(),
                agent_id,
                description,
                tier_used: job.tier,
            },
            status,
            0,
            None,
            Some(outcome),
        )?;
        if let Some(reward) = self.learning.reward_task(store, &task)? {
            rewards += reward.amount;
        }
        Ok((1, rewards))
    }

    /// Resolve every reported task before any row is written, so a bad
    /// entry cannot leave the session half ingested.
    fn plan_tasks<'a>(
        &self,
        store: &Store,
        job: &JobStatus,
        artifact: &'a WorkerArtifact,
    ) -> Result<Vec<(&'a ArtifactTask, i64)>> {
        let mut planned = Vec::with_capacity(artifact.tasks.len());
        for reported in &artifact.tasks {
            if reported.description.trim().is_empty() {
                warn!(job_id = %job.id, agent = %reported.agent, "Reported task has no description, skipped");
                continue;
            }
            let agent_id = match store.get_agent_by_name(&reported.agent)? {
                Some(agent) => Some(agent.id),
                None => {
                    warn!(job_id = %job.id, agent = %reported.agent, "Unknown agent in artifact, using routed agent");
                    job.agent_id
                }
            };
            match agent_id {
                Some(agent_id) => planned.push((reported, agent_id)),
                None => warn!(job_id = %job.id, "No agent for reported task, skipped"),
            }
        }
        Ok(planned)
    }

    fn record_task(
        &self,
        store: &Store,
        new: NewTask,
        status: TaskStatus,
        retries: i64,
        error: Option<&str>,
        outcome: Option<TaskOutcome>,
    ) -> Result<Task> {
        let mut task = store.create_task(&new)?;
        if status != TaskStatus::Pending {
            task = store.start_task(&task.id)?;
        }
        for _ in 0..retries.max(0) {
            store.increment_task_retry(&task.id)?;
        }
        match (status, outcome) {
            (TaskStatus::Blocked, _) => store.block_task(&task.id, error),
            (_, Some(outcome)) => store.complete_task(&task.id, &outcome),
            _ => store
                .get_task(&task.id)?
                .ok_or_else(|| ov_core::Error::not_found("task", &task.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::WorkflowKind;
    use chrono::Utc;
    use ov_core::store::{EntityRef, NewAgent, NewSession};

    struct Fixture {
        store: Store,
        session: Session,
        agent_id: i64,
    }

    fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        let agent = store.create_agent(&NewAgent::new(team.id, "builder", "engineer")).unwrap();
        store.create_agent(&NewAgent::new(team.id, "reviewer", "engineer")).unwrap();
        let session = store
            .create_session(&NewSession {
                team_id: team.id,
                job_id: Some("job-1".to_string()),
                priority_input: Some("fix the login bug".to_string()),
                ..Default::default()
            })
            .unwrap();
        let session = store.start_session(&session.id).unwrap();
        Fixture {
            store,
            session,
            agent_id: agent.id,
        }
    }

    fn job(state: JobState, agent_id: i64) -> JobStatus {
        JobStatus {
            id: "job-1".to_string(),
            workflow: WorkflowKind::RepositoryEdit,
            team: "engineering".to_string(),
            state,
            session_id: None,
            agent_id: Some(agent_id),
            tier: Some(ExecutionTier::Balanced),
            command: vec!["worker".to_string()],
            pid: Some(1),
            exit_code: Some(0),
            error: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
        }
    }

    fn reconciled(outcome: ReconcileOutcome) -> ReconcileReport {
        match outcome {
            ReconcileOutcome::Reconciled(report) => report,
            other => panic!("expected reconciliation, got {other:?}"),
        }
    }

    #[test]
    fn test_artifact_tasks_become_rows_and_rewards() {
        let f = fixture();
        let artifact: WorkerArtifact = serde_json::from_str(
            r#"{
                "pr_url": "https://example.com/pr/1",
                "branch_name": "fix/login",
                "iterations": 4,
                "tasks": [
                    {"agent": "builder", "description": "patch handler", "status": "completed",
                     "duration_secs": 12.5, "usage": {"input_tokens": 1000000, "output_tokens": 0}},
                    {"agent": "reviewer", "description": "review", "status": "failed",
                     "error": "lint", "retry_count": 2},
                    {"agent": "ghost", "description": "docs", "status": "blocked"}
                ]
            }"#,
        )
        .unwrap();

        let reconciler = Reconciler::default();
        let report = reconciled(
            reconciler
                .reconcile(&f.store, &job(JobState::Succeeded, f.agent_id), Some(&artifact))
                .unwrap(),
        );
        assert_eq!(report.session_status, SessionStatus::Completed);
        assert_eq!(report.tasks, 3);
        // +10 -5 for tasks, +100 for a merged session
        assert_eq!(report.rewards, 105);

        let session = f.store.get_session(&f.session.id).unwrap().unwrap();
        assert_eq!(session.iterations, 4);
        assert_eq!(session.branch_name.as_deref(), Some("fix/login"));

        let tasks = f.store.list_tasks_for_session(&f.session.id).unwrap();
        let by_desc = |d: &str| tasks.iter().find(|t| t.description == d).unwrap();
        assert_eq!(by_desc("review").retry_count, 2);
        assert_eq!(by_desc("docs").status, TaskStatus::Blocked);
        assert_eq!(by_desc("docs").agent_id, f.agent_id);
        assert_eq!(by_desc("patch handler").duration_secs, Some(12.5));

        let costs = f.store.cost_by_tier(None).unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].key, "balanced");
        assert!((costs[0].total_cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_task_does_not_strand_the_rest() {
        let f = fixture();
        let artifact: WorkerArtifact = serde_json::from_str(
            r#"{
                "tasks": [
                    {"agent": "builder", "description": "first", "status": "completed"},
                    {"agent": "builder", "description": "  ", "status": "completed"},
                    {"agent": "reviewer", "description": "third", "status": "failed"}
                ]
            }"#,
        )
        .unwrap();

        let reconciler = Reconciler::default();
        let job = job(JobState::Succeeded, f.agent_id);
        let report = reconciled(reconciler.reconcile(&f.store, &job, Some(&artifact)).unwrap());
        assert_eq!(report.tasks, 2);
        assert_eq!(report.session_status, SessionStatus::Completed);

        let tasks = f.store.list_tasks_for_session(&f.session.id).unwrap();
        let mut descriptions: Vec<_> = tasks.iter().map(|t| t.description.as_str()).collect();
        descriptions.sort();
        assert_eq!(descriptions, ["first", "third"]);

        let again = reconciler.reconcile(&f.store, &job, Some(&artifact)).unwrap();
        assert!(matches!(again, ReconcileOutcome::AlreadyReconciled { .. }));
        assert_eq!(f.store.list_tasks_for_session(&f.session.id).unwrap().len(), 2);
    }

    #[test]
    fn test_artifact_without_usable_tasks_mirrors_job() {
        let f = fixture();
        let artifact: WorkerArtifact = serde_json::from_str(
            r#"{"tasks": [{"agent": "builder", "description": "", "status": "completed"}]}"#,
        )
        .unwrap();

        let report = reconciled(
            Reconciler::default()
                .reconcile(&f.store, &job(JobState::Succeeded, f.agent_id), Some(&artifact))
                .unwrap(),
        );
        assert_eq!(report.tasks, 1);
        let tasks = f.store.list_tasks_for_session(&f.session.id).unwrap();
        assert_eq!(tasks[0].description, "fix the login bug");
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let f = fixture();
        let reconciler = Reconciler::default();
        let job = job(JobState::Succeeded, f.agent_id);

        reconciled(reconciler.reconcile(&f.store, &job, None).unwrap());
        let again = reconciler.reconcile(&f.store, &job, None).unwrap();
        assert!(matches!(again, ReconcileOutcome::AlreadyReconciled { .. }));

        assert_eq!(f.store.list_tasks_for_session(&f.session.id).unwrap().len(), 1);
        let agent = f.store.get_agent(f.agent_id).unwrap().unwrap();
        assert_eq!(agent.total_tasks_completed, 1);
        assert_eq!(f.store.reward_total(&EntityRef::session(&f.session.id)).unwrap(), 50);
    }

    #[test]
    fn test_missing_artifact_mirrors_job_outcome() {
        let f = fixture();
        let mut failed = job(JobState::Failed, f.agent_id);
        failed.exit_code = Some(2);
        failed.error = Some("worker crashed".to_string());

        let report = reconciled(Reconciler::default().reconcile(&f.store, &failed, None).unwrap());
        assert_eq!(report.session_status, SessionStatus::Failed);

        let tasks = f.store.list_tasks_for_session(&f.session.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].description, "fix the login bug");
        assert_eq!(tasks[0].error.as_deref(), Some("worker crashed"));
        assert_eq!(tasks[0].tier_used, Some(ExecutionTier::Balanced));
    }

    #[test]
    fn test_killed_job_blocks_session() {
        let f = fixture();
        let report = reconciled(
            Reconciler::default()
                .reconcile(&f.store, &job(JobState::Killed, f.agent_id), None)
                .unwrap(),
        );
        assert_eq!(report.session_status, SessionStatus::Blocked);
        assert_eq!(f.store.reward_total(&EntityRef::session(&f.session.id)).unwrap(), -10);
    }

    #[test]
    fn test_running_and_orphan_jobs_are_skipped() {
        let f = fixture();
        let reconciler = Reconciler::default();
        assert!(matches!(
            reconciler.reconcile(&f.store, &job(JobState::Running, f.agent_id), None).unwrap(),
            ReconcileOutcome::Pending { .. }
        ));

        let mut orphan = job(JobState::Succeeded, f.agent_id);
        orphan.id = "job-2".to_string();
        assert!(matches!(
            reconciler.reconcile(&f.store, &orphan, None).unwrap(),
            ReconcileOutcome::NoSession { .. }
        ));
    }

    #[test]
    fn test_read_artifact_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.artifact.json");
        assert!(read_artifact(&path).unwrap().is_none());
        fs::write(&path, "{not json").unwrap();
        assert!(read_artifact(&path).unwrap().is_none());
        fs::write(&path, r#"{"status": "blocked"}"#).unwrap();
        let artifact = read_artifact(&path).unwrap().unwrap();
        assert_eq!(artifact.status, Some(ArtifactStatus::Blocked));
        assert!(artifact.tasks.is_empty());
    }
}
