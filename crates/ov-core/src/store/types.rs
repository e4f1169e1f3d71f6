//! Row types held by the state store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::router::ExecutionTier;

/// Declares a fieldless enum stored as lowercase text, with `as_str`,
/// `FromStr`, `Display` and rusqlite conversions.
macro_rules! sql_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::Error::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: crate::Error| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

pub(crate) use sql_enum;

sql_enum! {
    /// Lifecycle of a supervised worker run
    pub enum SessionStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Blocked => "blocked",
    }
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            // spawn failures never reach in_progress
            (Self::Pending, Self::Failed) => true,
            (Self::InProgress, n) => n.is_terminal(),
            _ => false,
        }
    }
}

sql_enum! {
    /// Lifecycle of one unit of agent work. `Blocked` is a parking state.
    pub enum TaskStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Blocked => "blocked",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::Blocked, Self::InProgress) => true,
            (Self::InProgress, Self::Blocked) => true,
            (Self::Pending | Self::InProgress | Self::Blocked, n) => n.is_terminal(),
            _ => false,
        }
    }
}

sql_enum! {
    /// Kinds of entity a metric or reward can be attached to
    pub enum EntityType {
        Team => "team",
        Agent => "agent",
        Session => "session",
        Task => "task",
        Experiment => "experiment",
        Pattern => "pattern",
    }
}

sql_enum! {
    pub enum ExperimentStatus {
        Active => "active",
        Successful => "successful",
        Failed => "failed",
        Killed => "killed",
    }
}

sql_enum! {
    /// Verdict of one experiment evaluation
    pub enum Decision {
        Keep => "keep",
        Kill => "kill",
        DoubleDown => "double_down",
        Continue => "continue",
    }
}

sql_enum! {
    pub enum PatternType {
        Success => "success",
        Failure => "failure",
        UserRepetition => "user_repetition",
    }
}

sql_enum! {
    pub enum PatternStatus {
        Active => "active",
        Verified => "verified",
        FalsePositive => "false_positive",
        Actioned => "actioned",
    }
}

sql_enum! {
    pub enum CandidateStatus {
        Pending => "pending",
        Approved => "approved",
        Dismissed => "dismissed",
    }
}

/// Reference to any entity that can carry metrics and rewards
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl ToString) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
        }
    }

    pub fn agent(id: i64) -> Self {
        Self::new(EntityType::Agent, id)
    }

    pub fn session(id: &str) -> Self {
        Self::new(EntityType::Session, id)
    }

    pub fn task(id: &str) -> Self {
        Self::new(EntityType::Task, id)
    }

    pub fn experiment(id: i64) -> Self {
        Self::new(EntityType::Experiment, id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub team_id: i64,
    pub name: String,
    pub role: String,
    pub glyph: String,
    pub preferred_tier: Option<ExecutionTier>,
    pub is_active: bool,
    pub success_rate: f64,
    pub total_tasks_completed: i64,
    pub total_tasks_failed: i64,
    pub avg_duration_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn finished_tasks(&self) -> i64 {
        self.total_tasks_completed + self.total_tasks_failed
    }
}

/// Fields needed to create an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub team_id: i64,
    pub name: String,
    pub role: String,
    #[serde(default = "default_glyph")]
    pub glyph: String,
    #[serde(default)]
    pub preferred_tier: Option<ExecutionTier>,
}

fn default_glyph() -> String {
    "*".to_string()
}

impl NewAgent {
    pub fn new(team_id: i64, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            team_id,
            name: name.into(),
            role: role.into(),
            glyph: default_glyph(),
            preferred_tier: None,
        }
    }

    pub fn with_glyph(mut self, glyph: impl Into<String>) -> Self {
        self.glyph = glyph.into();
        self
    }

    pub fn with_preferred_tier(mut self, tier: ExecutionTier) -> Self {
        self.preferred_tier = Some(tier);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub team_id: i64,
    pub job_id: Option<String>,
    pub target_repository: Option<String>,
    pub priority_input: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub status: SessionStatus,
    pub iterations: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub team_id: i64,
    pub job_id: Option<String>,
    pub target_repository: Option<String>,
    pub priority_input: Option<String>,
    pub branch_name: Option<String>,
}

/// Terminal write for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub pr_url: Option<String>,
    pub branch_name: Option<String>,
}

impl SessionOutcome {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            status,
            pr_url: None,
            branch_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub agent_id: i64,
    pub description: String,
    pub status: TaskStatus,
    pub tier_used: Option<ExecutionTier>,
    pub retry_count: i64,
    pub error: Option<String>,
    pub duration_secs: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub session_id: String,
    pub agent_id: i64,
    pub description: String,
    pub tier_used: Option<ExecutionTier>,
}

/// Terminal write for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub error: Option<String>,
    pub duration_secs: Option<f64>,
}

impl TaskOutcome {
    pub fn completed() -> Self {
        Self {
            status: TaskStatus::Completed,
            error: None,
            duration_secs: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            error: Some(error.into()),
            duration_secs: None,
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub entity: EntityRef,
    pub name: String,
    pub value: f64,
    pub context: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reward {
    pub id: i64,
    pub entity: EntityRef,
    pub amount: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub hypothesis: String,
    pub target_metric: String,
    pub target_value: Option<f64>,
    pub current_value: Option<f64>,
    pub sample_size: i64,
    pub consecutive_failures: i64,
    pub status: ExperimentStatus,
    pub decision: Option<Decision>,
    pub decision_reason: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Values written by one experiment evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDecision {
    pub current_value: f64,
    pub sample_size: i64,
    pub consecutive_failures: i64,
    pub decision: Decision,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: i64,
    pub slug: String,
    pub pattern_type: PatternType,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub description: String,
    pub detection_count: i64,
    pub confidence: f64,
    pub status: PatternStatus,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationCandidate {
    pub id: i64,
    pub intent: String,
    pub sample_commands: Vec<String>,
    pub occurrence_count: i64,
    pub confidence: f64,
    pub status: CandidateStatus,
    pub agent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCommand {
    pub id: i64,
    pub command: String,
    pub intent: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub task_id: Option<String>,
    pub agent_id: Option<i64>,
    pub tier: ExecutionTier,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUsage {
    pub task_id: Option<String>,
    pub agent_id: Option<i64>,
    pub tier: ExecutionTier,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub team_id: i64,
    pub name: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub campaign_id: Option<i64>,
    pub name: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row of the `active_sessions` view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSessionRow {
    pub session_id: String,
    pub team: String,
    pub status: SessionStatus,
    pub job_id: Option<String>,
    pub task_count: i64,
    pub agent_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Row of the `agent_performance` / `agent_leaderboard` views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformanceRow {
    pub agent_id: i64,
    pub agent: String,
    pub team: String,
    pub is_active: bool,
    pub completed: i64,
    pub failed: i64,
    pub success_pct: f64,
    pub avg_duration_secs: Option<f64>,
}

/// Row of the `experiment_summary` view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummaryRow {
    pub status: ExperimentStatus,
    pub experiments: i64,
    pub avg_current_value: Option<f64>,
}

/// Commands sharing one normalized intent inside a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRepetition {
    pub intent: String,
    pub occurrences: i64,
    pub sample_commands: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Aggregated cost over the usage ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub key: String,
    pub invocations: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::InProgress));
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::Pending.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::InProgress.can_transition_to(SessionStatus::Blocked));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::Blocked.can_transition_to(SessionStatus::InProgress));
    }

    #[test]
    fn test_task_transitions() {
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Blocked));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!("double_down".parse::<Decision>().unwrap(), Decision::DoubleDown);
        assert_eq!(PatternStatus::FalsePositive.as_str(), "false_positive");
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_entity_ref_display() {
        assert_eq!(EntityRef::agent(7).to_string(), "agent:7");
        assert_eq!(EntityRef::experiment(2).entity_id, "2");
    }
}
