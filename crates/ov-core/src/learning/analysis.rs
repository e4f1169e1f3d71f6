//! Session analysis and per-agent insights

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::LearningController;
use crate::store::{Agent, EntityRef, EntityType, Pattern, Store, TaskStatus};
use crate::{Error, Result};

/// What a finished session told us
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnalysis {
    pub session_id: String,
    pub completed: i64,
    pub failed: i64,
    /// None when no task reached a terminal state
    pub success_rate: Option<f64>,
    pub duration_secs: Option<f64>,
    pub iterations: i64,
    pub pattern: Option<Pattern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    DoubleDown,
    Investigate,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInsight {
    pub agent_id: i64,
    pub agent: String,
    pub finished_tasks: i64,
    pub success_rate: Option<f64>,
    pub recommendation: Recommendation,
    pub reason: String,
}

impl LearningController {
    /// Record session metrics and register a success or failure pattern for
    /// the session's team when the outcome is clear-cut.
    pub fn analyze_session(&self, store: &Store, session_id: &str) -> Result<SessionAnalysis> {
        let session = store
            .get_session(session_id)?
            .ok_or_else(|| Error::not_found("session", session_id))?;
        let tasks = store.list_tasks_for_session(session_id)?;

        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as i64;
        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count() as i64;
        let finished = completed + failed;
        let success_rate = (finished > 0).then(|| completed as f64 / finished as f64);

        let start = session.started_at.unwrap_or(session.created_at);
        let duration_secs = session
            .completed_at
            .map(|end| (end - start).num_milliseconds().max(0) as f64 / 1000.0);

        let entity = EntityRef::session(session_id);
        if let Some(secs) = duration_secs {
            store.record_metric(&entity, "duration_secs", secs, None)?;
        }
        store.record_metric(&entity, "iterations", session.iterations as f64, None)?;
        if let Some(rate) = success_rate {
            store.record_metric(&entity, "success_rate", rate, None)?;
        }

        let pattern = match success_rate {
            Some(rate) => {
                let team = store
                    .get_team(session.team_id)?
                    .ok_or_else(|| Error::not_found("team", session.team_id))?;
                let team_ref = EntityRef::new(EntityType::Team, team.id);
                if rate >= self.config.session_success_rate {
                    Some(self.patterns.detect_success(
                        store,
                        &format!("sessions for team {} finish their tasks", team.name),
                        &team_ref,
                    )?)
                } else if rate < self.config.session_failure_rate {
                    Some(self.patterns.detect_failure(
                        store,
                        &format!("sessions for team {} fail most tasks", team.name),
                        &team_ref,
                    )?)
                } else {
                    None
                }
            }
            None => None,
        };

        debug!(session_id, completed, failed, "Session analyzed");
        Ok(SessionAnalysis {
            session_id: session_id.to_string(),
            completed,
            failed,
            success_rate,
            duration_secs,
            iterations: session.iterations,
            pattern,
        })
    }

    /// Recommendation for one agent from its rollup counters.
    pub fn agent_insight(&self, agent: &Agent) -> AgentInsight {
        let finished = agent.finished_tasks();
        let rate = (finished > 0).then(|| agent.total_tasks_completed as f64 / finished as f64);

        let (recommendation, reason) = match rate {
            Some(r) if r >= self.config.agent_double_down_rate => (
                Recommendation::DoubleDown,
                format!("{:.0}% success over {} tasks", r * 100.0, finished),
            ),
            Some(r)
                if r < self.config.agent_investigate_rate
                    && finished >= i64::from(self.config.agent_investigate_min_tasks) =>
            {
                (
                    Recommendation::Investigate,
                    format!("only {:.0}% success over {} tasks", r * 100.0, finished),
                )
            }
            Some(r) => (
                Recommendation::Continue,
                format!("{:.0}% success over {} tasks", r * 100.0, finished),
            ),
            None => (Recommendation::Continue, "no finished tasks yet".to_string()),
        };

        AgentInsight {
            agent_id: agent.id,
            agent: agent.name.clone(),
            finished_tasks: finished,
            success_rate: rate,
            recommendation,
            reason,
        }
    }

    pub fn agent_insights(&self, store: &Store) -> Result<Vec<AgentInsight>> {
        Ok(store
            .list_agents(None, true)?
            .iter()
            .map(|agent| self.agent_insight(agent))
            .collect())
    }
}
