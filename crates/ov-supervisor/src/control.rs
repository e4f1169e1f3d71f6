//! Control plane façade
//!
//! Ties the supervisor to the store, router and learning controller. Every
//! inbound operation (HTTP, scheduler, CLI) goes through here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ov_core::config::Config;
use ov_core::router::ExecutionTier;
use ov_core::store::{
    self, ActiveSessionRow, Agent, AgentPerformanceRow, AutomationCandidate, CostBreakdown,
    NewSession, SessionOutcome, SessionStatus, SharedStore, Store, UserCommand,
};
use ov_core::{
    ActionablePatterns, AgentInsight, Error, ExperimentEvaluation, LearningController,
    PatternDetector, Result, RoutingPlan, TaskRouter,
};

use crate::job::{JobHandle, JobStatus, LaunchContext};
use crate::reconcile::{ReconcileOutcome, Reconciler, read_artifact};
use crate::spec::{JobRequest, JobSpec};
use crate::supervisor::Supervisor;

/// Result of a job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub job: JobHandle,
    pub session_id: String,
    pub tier: ExecutionTier,
    pub plan: RoutingPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternScan {
    pub actionable: ActionablePatterns,
    pub candidates: Vec<AutomationCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReport {
    pub by_tier: Vec<CostBreakdown>,
    pub by_agent: Vec<CostBreakdown>,
}

pub struct ControlPlane {
    store: SharedStore,
    supervisor: Arc<Supervisor>,
    router: TaskRouter,
    learning: LearningController,
    reconciler: Reconciler,
}

impl ControlPlane {
    pub fn new(
        store: SharedStore,
        supervisor: Arc<Supervisor>,
        router: TaskRouter,
        learning: LearningController,
    ) -> Self {
        let reconciler = Reconciler::new(router.clone(), learning.clone());
        Self {
            store,
            supervisor,
            router,
            learning,
            reconciler,
        }
    }

    /// Open the store, recover the supervisor and seed the configured teams.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Store::new(&config.store.db_path)?;
        let router = TaskRouter::new(config.router.clone());
        router.seed_organization(&store)?;
        let supervisor = Arc::new(Supervisor::new(config.supervisor.clone())?);
        let learning = LearningController::new(
            config.learning.clone(),
            PatternDetector::new(config.patterns.clone()),
        );
        Ok(Self::new(store.into_shared(), supervisor, router, learning))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    /// Validate, route, open a session and launch the worker.
    pub async fn submit(&self, request: JobRequest) -> Result<Submission> {
        let spec = JobSpec::from_request(request)?;
        self.supervisor.executable(spec.workflow.kind())?;
        let job_id = Supervisor::new_job_id();

        let (plan, session) = {
            let store = store::lock(&self.store)?;
            let plan = self.router.plan(&store, &spec.task_spec())?;
            let session = store.create_session(&NewSession {
                team_id: plan.routing.team.id,
                job_id: Some(job_id.clone()),
                target_repository: spec
                    .workflow
                    .target_repository()
                    .map(|p| p.display().to_string()),
                priority_input: spec
                    .description
                    .clone()
                    .or_else(|| spec.workflow.priority_file().map(|p| p.display().to_string())),
                branch_name: spec.workflow.branch_name().map(str::to_string),
            })?;
            let session = store.start_session(&session.id)?;
            (plan, session)
        };

        let tier = spec.model_override.unwrap_or_else(|| plan.tier());
        let ctx = LaunchContext {
            job_id: Some(job_id.clone()),
            session_id: Some(session.id.clone()),
            agent_id: plan.routing.agent.as_ref().map(|a| a.id),
            tier: Some(tier),
        };

        match self.supervisor.start(&spec, ctx).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    session_id = %session.id,
                    team = %plan.routing.team.name,
                    tier = %tier,
                    "Job submitted"
                );
                Ok(Submission {
                    job,
                    session_id: session.id,
                    tier,
                    plan,
                })
            }
            Err(e @ Error::ProcessSpawn { .. }) => {
                if let Err(re) = self.reconcile_job(&job_id).await {
                    warn!(job_id = %job_id, "Reconciling failed spawn: {}", re);
                }
                Err(e)
            }
            Err(e) => {
                let store = store::lock(&self.store)?;
                store.finish_session(&session.id, &SessionOutcome::new(SessionStatus::Failed))?;
                Err(e)
            }
        }
    }

    pub async fn stop(&self, job_id: &str) -> Result<bool> {
        let stopped = self.supervisor.stop(job_id).await?;
        if stopped {
            self.reconcile_job(job_id).await?;
        }
        Ok(stopped)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        self.supervisor.status(job_id).await
    }

    pub async fn logs(&self, job_id: &str, max_lines: usize) -> Result<Option<String>> {
        self.supervisor.logs(job_id, max_lines).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobHandle>> {
        self.supervisor.list_all().await
    }

    /// Ingest one finished job. Safe to call repeatedly.
    pub async fn reconcile_job(&self, job_id: &str) -> Result<ReconcileOutcome> {
        let job = self.supervisor.status(job_id).await?;
        if !job.state.is_terminal() {
            return Ok(ReconcileOutcome::Pending {
                job_id: job_id.to_string(),
            });
        }
        let artifact = read_artifact(&self.supervisor.layout().artifact_path(job_id))?;
        let store = store::lock(&self.store)?;
        self.reconciler.reconcile(&store, &job, artifact.as_ref())
    }

    /// Settle adopted jobs and ingest every finished job not yet reconciled.
    pub async fn reconcile_finished(&self) -> Result<Vec<ReconcileOutcome>> {
        let settled = self.supervisor.reconcile_detached().await?;
        if !settled.is_empty() {
            info!(jobs = settled.len(), "Settled adopted jobs");
        }

        let mut reconciled = Vec::new();
        for job in self.supervisor.list_all().await? {
            if !job.state.is_terminal() {
                continue;
            }
            match self.reconcile_job(&job.id).await {
                Ok(outcome @ ReconcileOutcome::Reconciled(_)) => reconciled.push(outcome),
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, "Reconciliation failed: {}", e),
            }
        }
        Ok(reconciled)
    }

    /// Reconcile jobs as they finish. Runs until the runtime shuts down.
    pub fn spawn_ingest(self: &Arc<Self>) -> JoinHandle<()> {
        let plane = Arc::clone(self);
        let mut events = self.supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.state.is_terminal() => {
                        debug!(job_id = %event.job_id, state = %event.state, "Ingesting finished job");
                        if let Err(e) = plane.reconcile_job(&event.job_id).await {
                            warn!(job_id = %event.job_id, "Reconciliation failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Job events lagged, running full reconciliation");
                        if let Err(e) = plane.reconcile_finished().await {
                            warn!("Full reconciliation failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn evaluate_experiments(&self) -> Result<Vec<ExperimentEvaluation>> {
        let store = store::lock(&self.store)?;
        self.learning.evaluate_all_active(&store)
    }

    pub fn run_pattern_detection(&self) -> Result<PatternScan> {
        let store = store::lock(&self.store)?;
        let detector = self.learning.patterns();
        Ok(PatternScan {
            actionable: detector.get_actionable(&store)?,
            candidates: detector.analyze_command_repetition(&store)?,
        })
    }

    pub fn log_command(&self, command: &str) -> Result<UserCommand> {
        let store = store::lock(&self.store)?;
        self.learning.patterns().log_command(&store, command)
    }

    pub fn approve_candidate(&self, candidate_id: i64, team: &str) -> Result<(AutomationCandidate, Agent)> {
        let store = store::lock(&self.store)?;
        self.learning.patterns().approve_candidate(&store, candidate_id, team)
    }

    pub fn dismiss_candidate(&self, candidate_id: i64) -> Result<AutomationCandidate> {
        let store = store::lock(&self.store)?;
        self.learning.patterns().dismiss_candidate(&store, candidate_id)
    }

    pub fn active_sessions(&self) -> Result<Vec<ActiveSessionRow>> {
        store::lock(&self.store)?.active_sessions()
    }

    pub fn agent_performance(&self) -> Result<Vec<AgentPerformanceRow>> {
        store::lock(&self.store)?.agent_performance()
    }

    pub fn agent_insights(&self) -> Result<Vec<AgentInsight>> {
        let store = store::lock(&self.store)?;
        self.learning.agent_insights(&store)
    }

    pub fn costs(&self) -> Result<CostReport> {
        let store = store::lock(&self.store)?;
        Ok(CostReport {
            by_tier: store.cost_by_tier(None)?,
            by_agent: store.cost_by_agent(None)?,
        })
    }
}
