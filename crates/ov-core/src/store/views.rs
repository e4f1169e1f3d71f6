//! Reads over the precomputed views

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use super::types::{ActiveSessionRow, AgentPerformanceRow, CommandRepetition, ExperimentSummaryRow};
use super::{Store, ts, ts_col};
use crate::Result;

fn performance_from_row(row: &Row<'_>) -> rusqlite::Result<AgentPerformanceRow> {
    Ok(AgentPerformanceRow {
        agent_id: row.get(0)?,
        agent: row.get(1)?,
        team: row.get(2)?,
        is_active: row.get(3)?,
        completed: row.get(4)?,
        failed: row.get(5)?,
        success_pct: row.get(6)?,
        avg_duration_secs: row.get(7)?,
    })
}

fn repetition_from_row(row: &Row<'_>) -> rusqlite::Result<CommandRepetition> {
    Ok(CommandRepetition {
        intent: row.get(0)?,
        occurrences: row.get(1)?,
        sample_commands: Vec::new(),
        first_seen: ts_col(row, 2)?,
        last_seen: ts_col(row, 3)?,
    })
}

impl Store {
    pub fn active_sessions(&self) -> Result<Vec<ActiveSessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, team, status, job_id, task_count, agent_count, created_at
             FROM active_sessions ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ActiveSessionRow {
                    session_id: row.get(0)?,
                    team: row.get(1)?,
                    status: row.get(2)?,
                    job_id: row.get(3)?,
                    task_count: row.get(4)?,
                    agent_count: row.get(5)?,
                    created_at: ts_col(row, 6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn agent_performance(&self) -> Result<Vec<AgentPerformanceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, agent, team, is_active, completed, failed, success_pct, avg_duration_secs
             FROM agent_performance ORDER BY agent_id",
        )?;
        let rows = stmt
            .query_map([], performance_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn agent_leaderboard(&self, limit: usize) -> Result<Vec<AgentPerformanceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, agent, team, is_active, completed, failed, success_pct, avg_duration_secs
             FROM agent_leaderboard LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], performance_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn experiment_summary(&self) -> Result<Vec<ExperimentSummaryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, experiments, avg_current_value FROM experiment_summary ORDER BY status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ExperimentSummaryRow {
                    status: row.get(0)?,
                    experiments: row.get(1)?,
                    avg_current_value: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The fixed 7-day / 3-occurrence grouping from the `command_repetitions` view.
    pub fn command_repetitions(&self, max_samples: usize) -> Result<Vec<CommandRepetition>> {
        let mut stmt = self.conn.prepare(
            "SELECT intent, occurrences, first_seen, last_seen
             FROM command_repetitions ORDER BY occurrences DESC, intent",
        )?;
        let mut rows = stmt
            .query_map([], repetition_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let earliest = rows.iter().map(|r| r.first_seen).min();
        if let Some(since) = earliest {
            self.attach_samples(&mut rows, &since, max_samples)?;
        }
        Ok(rows)
    }

    /// Intents with at least `min_occurrences` commands logged since `since`.
    pub fn command_repetitions_since(
        &self,
        since: &DateTime<Utc>,
        min_occurrences: u32,
        max_samples: usize,
    ) -> Result<Vec<CommandRepetition>> {
        let mut stmt = self.conn.prepare(
            "SELECT intent, COUNT(*), MIN(created_at), MAX(created_at)
             FROM user_commands
             WHERE created_at >= ?1
             GROUP BY intent
             HAVING COUNT(*) >= ?2
             ORDER BY COUNT(*) DESC, intent",
        )?;
        let mut rows = stmt
            .query_map(params![ts(since), min_occurrences], repetition_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.attach_samples(&mut rows, since, max_samples)?;
        Ok(rows)
    }

    fn attach_samples(
        &self,
        rows: &mut [CommandRepetition],
        since: &DateTime<Utc>,
        max_samples: usize,
    ) -> Result<()> {
        if rows.is_empty() || max_samples == 0 {
            return Ok(());
        }
        let mut stmt = self.conn.prepare(
            "SELECT intent, command FROM user_commands WHERE created_at >= ?1 ORDER BY id DESC",
        )?;
        let mut samples: HashMap<String, Vec<String>> = HashMap::new();
        let pairs = stmt.query_map(params![ts(since)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for pair in pairs {
            let (intent, command) = pair?;
            let list = samples.entry(intent).or_default();
            if list.len() < max_samples && !list.contains(&command) {
                list.push(command);
            }
        }
        for row in rows.iter_mut() {
            row.sample_commands = samples.remove(&row.intent).unwrap_or_default();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{NewAgent, NewSession, NewTask, TaskOutcome};

    #[test]
    fn test_active_sessions_counts() {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        let a = store.create_agent(&NewAgent::new(team.id, "a", "engineer")).unwrap();
        let b = store.create_agent(&NewAgent::new(team.id, "b", "engineer")).unwrap();
        let session = store
            .create_session(&NewSession {
                team_id: team.id,
                ..Default::default()
            })
            .unwrap();
        for agent_id in [a.id, a.id, b.id] {
            store
                .create_task(&NewTask {
                    session_id: session.id.clone(),
                    agent_id,
                    description: "work".to_string(),
                    tier_used: None,
                })
                .unwrap();
        }

        let rows = store.active_sessions().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_count, 3);
        assert_eq!(rows[0].agent_count, 2);
        assert_eq!(rows[0].team, "engineering");
    }

    #[test]
    fn test_agent_performance_percentages() {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        let agent = store.create_agent(&NewAgent::new(team.id, "a", "engineer")).unwrap();
        store.create_agent(&NewAgent::new(team.id, "idle", "engineer")).unwrap();
        let session = store
            .create_session(&NewSession {
                team_id: team.id,
                ..Default::default()
            })
            .unwrap();
        for ok in [true, true, true, false] {
            let task = store
                .create_task(&NewTask {
                    session_id: session.id.clone(),
                    agent_id: agent.id,
                    description: "work".to_string(),
                    tier_used: None,
                })
                .unwrap();
            let outcome = if ok { TaskOutcome::completed() } else { TaskOutcome::failed("x") };
            store.complete_task(&task.id, &outcome).unwrap();
        }

        let rows = store.agent_performance().unwrap();
        assert_eq!(rows[0].success_pct, 75.0);
        assert_eq!(rows[1].success_pct, 0.0);

        let board = store.agent_leaderboard(10).unwrap();
        assert_eq!(board[0].agent, "a");
    }

    #[test]
    fn test_command_repetition_window() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);

        store.log_user_command_at("deploy staging", "deploy staging", &old).unwrap();
        store.log_user_command("deploy staging now", "deploy staging").unwrap();
        store.log_user_command("deploy staging", "deploy staging").unwrap();
        assert!(store.command_repetitions(5).unwrap().is_empty());

        store.log_user_command("please deploy staging", "deploy staging").unwrap();
        let rows = store.command_repetitions(5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].occurrences, 3);
        assert_eq!(rows[0].sample_commands.len(), 3);

        let since = now - chrono::Duration::days(30);
        let wide = store.command_repetitions_since(&since, 3, 2).unwrap();
        assert_eq!(wide[0].occurrences, 4);
        assert_eq!(wide[0].sample_commands.len(), 2);
    }

    #[test]
    fn test_experiment_summary() {
        let store = Store::in_memory().unwrap();
        store.create_experiment("a", "h", "outcome", None).unwrap();
        store.create_experiment("b", "h", "outcome", None).unwrap();
        let summary = store.experiment_summary().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].experiments, 2);
    }
}
