//! Experiments, patterns and automation candidates

use rusqlite::{Row, params};
use tracing::info;

use super::org::agent_from_row;
use super::types::{
    Agent, AutomationCandidate, CandidateStatus, EntityType, Experiment, ExperimentDecision,
    ExperimentStatus, Pattern, PatternStatus, PatternType,
};
use super::{Store, json_col, now_ts, opt_ts_col, optional, ts_col};
use crate::{Error, Result};

const EXPERIMENT_COLUMNS: &str = "id, name, hypothesis, target_metric, target_value, current_value,
     sample_size, consecutive_failures, status, decision, decision_reason, decided_at, created_at";

const PATTERN_COLUMNS: &str = "id, slug, pattern_type, entity_type, entity_id, description,
     detection_count, confidence, status, first_detected, last_detected";

const CANDIDATE_COLUMNS: &str = "id, intent, sample_commands, occurrence_count, confidence, status,
     agent_id, created_at, updated_at";

fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        hypothesis: row.get(2)?,
        target_metric: row.get(3)?,
        target_value: row.get(4)?,
        current_value: row.get(5)?,
        sample_size: row.get(6)?,
        consecutive_failures: row.get(7)?,
        status: row.get(8)?,
        decision: row.get(9)?,
        decision_reason: row.get(10)?,
        decided_at: opt_ts_col(row, 11)?,
        created_at: ts_col(row, 12)?,
    })
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    Ok(Pattern {
        id: row.get(0)?,
        slug: row.get(1)?,
        pattern_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        description: row.get(5)?,
        detection_count: row.get(6)?,
        confidence: row.get(7)?,
        status: row.get(8)?,
        first_detected: ts_col(row, 9)?,
        last_detected: ts_col(row, 10)?,
    })
}

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationCandidate> {
    Ok(AutomationCandidate {
        id: row.get(0)?,
        intent: row.get(1)?,
        sample_commands: json_col(row, 2)?,
        occurrence_count: row.get(3)?,
        confidence: row.get(4)?,
        status: row.get(5)?,
        agent_id: row.get(6)?,
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}

/// A detection to insert or reinforce
#[derive(Debug, Clone)]
pub struct PatternDetection<'a> {
    pub slug: &'a str,
    pub pattern_type: PatternType,
    pub entity_type: EntityType,
    pub entity_id: Option<&'a str>,
    pub description: &'a str,
    pub initial_confidence: f64,
    pub confidence_step: f64,
}

impl Store {
    pub fn create_experiment(
        &self,
        name: &str,
        hypothesis: &str,
        target_metric: &str,
        target_value: Option<f64>,
    ) -> Result<Experiment> {
        if name.trim().is_empty() {
            return Err(Error::Validation("experiment name must not be empty".to_string()));
        }
        self.conn
            .execute(
                "INSERT INTO experiments (name, hypothesis, target_metric, target_value, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, hypothesis, target_metric, target_value, now_ts()],
            )
            .map_err(|e| Error::from_sqlite(e, "create experiment"))?;
        let id = self.conn.last_insert_rowid();
        info!(experiment = name, "Created experiment {}", id);
        self.get_experiment(id)?
            .ok_or_else(|| Error::not_found("experiment", id))
    }

    pub fn get_experiment(&self, id: i64) -> Result<Option<Experiment>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM experiments WHERE id = ?1", EXPERIMENT_COLUMNS),
            params![id],
            experiment_from_row,
        ))
    }

    pub fn list_experiments(&self, status: Option<ExperimentStatus>) -> Result<Vec<Experiment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM experiments WHERE ?1 IS NULL OR status = ?1 ORDER BY id",
            EXPERIMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![status], experiment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Write one evaluation result as a single row update.
    pub fn write_experiment_decision(
        &self,
        id: i64,
        decision: &ExperimentDecision,
    ) -> Result<Experiment> {
        let changed = self.conn.execute(
            "UPDATE experiments SET current_value = ?2, sample_size = ?3,
                                    consecutive_failures = ?4, decision = ?5,
                                    decision_reason = ?6, decided_at = ?7
             WHERE id = ?1 AND status = 'active'",
            params![
                id,
                decision.current_value,
                decision.sample_size,
                decision.consecutive_failures,
                decision.decision,
                decision.reason,
                now_ts()
            ],
        )?;
        let experiment = self
            .get_experiment(id)?
            .ok_or_else(|| Error::not_found("experiment", id))?;
        if changed == 0 {
            return Err(Error::invalid_transition(
                "experiment",
                experiment.status,
                "decided",
            ));
        }
        Ok(experiment)
    }

    /// Close an active experiment. The row is frozen afterwards.
    pub fn conclude_experiment(&self, id: i64, status: ExperimentStatus) -> Result<Experiment> {
        if status == ExperimentStatus::Active {
            return Err(Error::Validation(
                "an experiment cannot be concluded as active".to_string(),
            ));
        }
        let changed = self.conn.execute(
            "UPDATE experiments SET status = ?2 WHERE id = ?1 AND status = 'active'",
            params![id, status],
        )?;
        let experiment = self
            .get_experiment(id)?
            .ok_or_else(|| Error::not_found("experiment", id))?;
        if changed == 0 {
            return Err(Error::invalid_transition("experiment", experiment.status, status));
        }
        info!(experiment_id = id, status = %status, "Experiment concluded");
        Ok(experiment)
    }

    /// Insert a pattern, or reinforce the existing row with the same slug.
    /// Actioned patterns are left untouched.
    pub fn upsert_pattern(&self, detection: &PatternDetection<'_>) -> Result<Pattern> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO patterns (slug, pattern_type, entity_type, entity_id, description,
                                   detection_count, confidence, status, first_detected, last_detected)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, MIN(1.0, MAX(0.0, ?6)), 'active', ?8, ?8)
             ON CONFLICT(slug) DO UPDATE SET
                 detection_count = detection_count + 1,
                 confidence = MIN(1.0, confidence + ?7),
                 last_detected = ?8
             WHERE patterns.status != 'actioned'",
            params![
                detection.slug,
                detection.pattern_type,
                detection.entity_type,
                detection.entity_id,
                detection.description,
                detection.initial_confidence,
                detection.confidence_step,
                now
            ],
        )?;
        self.get_pattern_by_slug(detection.slug)?
            .ok_or_else(|| Error::not_found("pattern", detection.slug))
    }

    pub fn get_pattern(&self, id: i64) -> Result<Option<Pattern>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM patterns WHERE id = ?1", PATTERN_COLUMNS),
            params![id],
            pattern_from_row,
        ))
    }

    pub fn get_pattern_by_slug(&self, slug: &str) -> Result<Option<Pattern>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM patterns WHERE slug = ?1", PATTERN_COLUMNS),
            params![slug],
            pattern_from_row,
        ))
    }

    pub fn list_patterns(
        &self,
        pattern_type: Option<PatternType>,
        status: Option<PatternStatus>,
    ) -> Result<Vec<Pattern>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM patterns
             WHERE (?1 IS NULL OR pattern_type = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY confidence DESC, detection_count DESC, id",
            PATTERN_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pattern_type, status], pattern_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_pattern_status(&self, id: i64, status: PatternStatus) -> Result<Pattern> {
        let changed = self.conn.execute(
            "UPDATE patterns SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        if changed == 0 {
            return Err(Error::not_found("pattern", id));
        }
        self.get_pattern(id)?.ok_or_else(|| Error::not_found("pattern", id))
    }

    /// Insert a candidate, or refresh a pending one with the same intent.
    pub fn upsert_candidate(
        &self,
        intent: &str,
        sample_commands: &[String],
        occurrence_count: i64,
        confidence: f64,
    ) -> Result<AutomationCandidate> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO automation_candidates (intent, sample_commands, occurrence_count,
                                                confidence, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, MIN(1.0, MAX(0.0, ?4)), 'pending', ?5, ?5)
             ON CONFLICT(intent) DO UPDATE SET
                 sample_commands = excluded.sample_commands,
                 occurrence_count = excluded.occurrence_count,
                 confidence = excluded.confidence,
                 updated_at = excluded.updated_at
             WHERE automation_candidates.status = 'pending'",
            params![
                intent,
                serde_json::to_string(sample_commands)?,
                occurrence_count,
                confidence,
                now
            ],
        )?;
        self.get_candidate_by_intent(intent)?
            .ok_or_else(|| Error::not_found("automation candidate", intent))
    }

    pub fn get_candidate(&self, id: i64) -> Result<Option<AutomationCandidate>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM automation_candidates WHERE id = ?1", CANDIDATE_COLUMNS),
            params![id],
            candidate_from_row,
        ))
    }

    pub fn get_candidate_by_intent(&self, intent: &str) -> Result<Option<AutomationCandidate>> {
        optional(self.conn.query_row(
            &format!(
                "SELECT {} FROM automation_candidates WHERE intent = ?1",
                CANDIDATE_COLUMNS
            ),
            params![intent],
            candidate_from_row,
        ))
    }

    pub fn list_candidates(&self, status: Option<CandidateStatus>) -> Result<Vec<AutomationCandidate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM automation_candidates
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY occurrence_count DESC, id",
            CANDIDATE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![status], candidate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Create the agent a candidate proposes and link it. A candidate can be
    /// approved at most once.
    pub fn approve_candidate(
        &self,
        id: i64,
        team_id: i64,
        agent_name: &str,
        role: &str,
    ) -> Result<(AutomationCandidate, Agent)> {
        let tx = self.conn.unchecked_transaction()?;
        let status: CandidateStatus = optional(tx.query_row(
            "SELECT status FROM automation_candidates WHERE id = ?1",
            params![id],
            |row| row.get(0),
        ))?
        .ok_or_else(|| Error::not_found("automation candidate", id))?;

        if status != CandidateStatus::Pending {
            return Err(Error::invalid_transition(
                "automation candidate",
                status,
                CandidateStatus::Approved,
            ));
        }

        let now = now_ts();
        tx.execute(
            "INSERT INTO agents (team_id, name, role, glyph, created_at, updated_at)
             VALUES (?1, ?2, ?3, '+', ?4, ?4)",
            params![team_id, agent_name, role, now],
        )
        .map_err(|e| Error::from_sqlite(e, "approve candidate"))?;
        let agent_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE automation_candidates SET status = 'approved', agent_id = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, agent_id, now],
        )?;

        let agent = tx.query_row(
            "SELECT id, team_id, name, role, glyph, preferred_tier, is_active, success_rate,
                    total_tasks_completed, total_tasks_failed, avg_duration_secs, created_at, updated_at
             FROM agents WHERE id = ?1",
            params![agent_id],
            agent_from_row,
        )?;
        tx.commit()?;

        info!(candidate_id = id, agent_id, agent = agent_name, "Automation candidate approved");
        let candidate = self
            .get_candidate(id)?
            .ok_or_else(|| Error::not_found("automation candidate", id))?;
        Ok((candidate, agent))
    }

    pub fn dismiss_candidate(&self, id: i64) -> Result<AutomationCandidate> {
        let changed = self.conn.execute(
            "UPDATE automation_candidates SET status = 'dismissed', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now_ts()],
        )?;
        let candidate = self
            .get_candidate(id)?
            .ok_or_else(|| Error::not_found("automation candidate", id))?;
        if changed == 0 {
            return Err(Error::invalid_transition(
                "automation candidate",
                candidate.status,
                CandidateStatus::Dismissed,
            ));
        }
        Ok(candidate)
    }
}
