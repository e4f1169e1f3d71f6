//! Sessions, tasks and the agent rollup

use rusqlite::{Connection, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{NewSession, NewTask, Session, SessionOutcome, SessionStatus, Task, TaskOutcome, TaskStatus};
use super::{Store, now_ts, opt_ts_col, optional, ts_col};
use crate::{Error, Result};

const SESSION_COLUMNS: &str = "id, team_id, job_id, target_repository, priority_input, branch_name,
     pr_url, status, iterations, started_at, completed_at, created_at, updated_at";

const TASK_COLUMNS: &str = "id, session_id, agent_id, description, status, tier_used, retry_count,
     error, duration_secs, started_at, completed_at, created_at";

/// Recomputes agent counters from the tasks table in one statement, so the
/// read and the write cannot interleave with another writer.
const ROLLUP_SQL: &str = "UPDATE agents SET
    total_tasks_completed = (SELECT COUNT(*) FROM tasks t
                             WHERE t.agent_id = agents.id AND t.status = 'completed'),
    total_tasks_failed    = (SELECT COUNT(*) FROM tasks t
                             WHERE t.agent_id = agents.id AND t.status = 'failed'),
    success_rate          = COALESCE((SELECT CAST(SUM(t.status = 'completed') AS REAL) / COUNT(*)
                                      FROM tasks t
                                      WHERE t.agent_id = agents.id
                                        AND t.status IN ('completed', 'failed')), 0.0),
    avg_duration_secs     = (SELECT AVG(t.duration_secs) FROM tasks t
                             WHERE t.agent_id = agents.id
                               AND t.status IN ('completed', 'failed')
                               AND t.duration_secs IS NOT NULL),
    updated_at = ?1";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        team_id: row.get(1)?,
        job_id: row.get(2)?,
        target_repository: row.get(3)?,
        priority_input: row.get(4)?,
        branch_name: row.get(5)?,
        pr_url: row.get(6)?,
        status: row.get(7)?,
        iterations: row.get(8)?,
        started_at: opt_ts_col(row, 9)?,
        completed_at: opt_ts_col(row, 10)?,
        created_at: ts_col(row, 11)?,
        updated_at: ts_col(row, 12)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        tier_used: row.get(5)?,
        retry_count: row.get(6)?,
        error: row.get(7)?,
        duration_secs: row.get(8)?,
        started_at: opt_ts_col(row, 9)?,
        completed_at: opt_ts_col(row, 10)?,
        created_at: ts_col(row, 11)?,
    })
}

fn rollup_agent(conn: &Connection, agent_id: i64) -> Result<()> {
    conn.execute(&format!("{} WHERE id = ?2", ROLLUP_SQL), params![now_ts(), agent_id])?;
    Ok(())
}

fn rollup_session_agents(conn: &Connection, session_id: &str) -> Result<usize> {
    let changed = conn.execute(
        &format!(
            "{} WHERE id IN (SELECT DISTINCT agent_id FROM tasks WHERE session_id = ?2)",
            ROLLUP_SQL
        ),
        params![now_ts(), session_id],
    )?;
    Ok(changed)
}

impl Store {
    pub fn create_session(&self, session: &NewSession) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO sessions (id, team_id, job_id, target_repository, priority_input,
                                       branch_name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
                params![
                    id,
                    session.team_id,
                    session.job_id,
                    session.target_repository,
                    session.priority_input,
                    session.branch_name,
                    now
                ],
            )
            .map_err(|e| Error::from_sqlite(e, "create session"))?;

        info!(session_id = %id, team_id = session.team_id, "Created session");
        self.get_session(&id)?.ok_or_else(|| Error::not_found("session", &id))
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        ))
    }

    pub fn get_session_by_job(&self, job_id: &str) -> Result<Option<Session>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM sessions WHERE job_id = ?1", SESSION_COLUMNS),
            params![job_id],
            session_from_row,
        ))
    }

    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE ?1 IS NULL OR status = ?1 ORDER BY created_at DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![status], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// `pending -> in_progress`
    pub fn start_session(&self, id: &str) -> Result<Session> {
        let now = now_ts();
        let changed = self.conn.execute(
            "UPDATE sessions SET status = 'in_progress', started_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        let session = self.get_session(id)?.ok_or_else(|| Error::not_found("session", id))?;
        if changed == 0 {
            return Err(Error::invalid_transition(
                "session",
                session.status,
                SessionStatus::InProgress,
            ));
        }
        Ok(session)
    }

    pub fn record_session_iteration(&self, id: &str) -> Result<i64> {
        let changed = self.conn.execute(
            "UPDATE sessions SET iterations = iterations + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("session", id));
        }
        let iterations = self.conn.query_row(
            "SELECT iterations FROM sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(iterations)
    }

    /// Overwrite the iteration count with a worker-reported value.
    pub fn set_session_iterations(&self, id: &str, iterations: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE sessions SET iterations = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, iterations.max(0), now_ts()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("session", id));
        }
        Ok(())
    }

    /// Move a session to a terminal state and, in the same transaction,
    /// roll up every agent that worked in it.
    pub fn finish_session(&self, id: &str, outcome: &SessionOutcome) -> Result<Session> {
        if !outcome.status.is_terminal() {
            return Err(Error::Validation(format!(
                "session outcome must be terminal, got '{}'",
                outcome.status
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        let current: SessionStatus = optional(tx.query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        ))?
        .ok_or_else(|| Error::not_found("session", id))?;

        if !current.can_transition_to(outcome.status) {
            return Err(Error::invalid_transition("session", current, outcome.status));
        }

        let now = now_ts();
        tx.execute(
            "UPDATE sessions SET status = ?2,
                                 pr_url = COALESCE(?3, pr_url),
                                 branch_name = COALESCE(?4, branch_name),
                                 completed_at = ?5,
                                 updated_at = ?5
             WHERE id = ?1",
            params![id, outcome.status, outcome.pr_url, outcome.branch_name, now],
        )?;
        let agents = rollup_session_agents(&tx, id)?;
        tx.commit()?;

        info!(session_id = %id, status = %outcome.status, agents, "Session finished");
        self.get_session(id)?.ok_or_else(|| Error::not_found("session", id))
    }

    pub fn create_task(&self, task: &NewTask) -> Result<Task> {
        if task.description.trim().is_empty() {
            return Err(Error::Validation("task description must not be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO tasks (id, session_id, agent_id, description, status, tier_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
                params![
                    id,
                    task.session_id,
                    task.agent_id,
                    task.description,
                    task.tier_used,
                    now_ts()
                ],
            )
            .map_err(|e| Error::from_sqlite(e, "create task"))?;

        debug!(task_id = %id, session_id = %task.session_id, agent_id = task.agent_id, "Created task");
        self.get_task(&id)?.ok_or_else(|| Error::not_found("task", &id))
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            task_from_row,
        ))
    }

    pub fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE session_id = ?1 ORDER BY created_at, id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![session_id], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Assign a task to its agent. A task already in progress is refused.
    pub fn start_task(&self, id: &str) -> Result<Task> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at = COALESCE(started_at, ?2)
             WHERE id = ?1 AND status IN ('pending', 'blocked')",
            params![id, now_ts()],
        )?;
        let task = self.get_task(id)?.ok_or_else(|| Error::not_found("task", id))?;
        if changed == 0 {
            return Err(Error::invalid_transition("task", task.status, TaskStatus::InProgress));
        }
        Ok(task)
    }

    /// Park an in-progress task.
    pub fn block_task(&self, id: &str, reason: Option<&str>) -> Result<Task> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = 'blocked', error = COALESCE(?2, error)
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, reason],
        )?;
        let task = self.get_task(id)?.ok_or_else(|| Error::not_found("task", id))?;
        if changed == 0 {
            return Err(Error::invalid_transition("task", task.status, TaskStatus::Blocked));
        }
        Ok(task)
    }

    /// Record a task's terminal state exactly once and roll up its agent.
    pub fn complete_task(&self, id: &str, outcome: &TaskOutcome) -> Result<Task> {
        if !outcome.status.is_terminal() {
            return Err(Error::Validation(format!(
                "task outcome must be completed or failed, got '{}'",
                outcome.status
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        let (agent_id, current): (i64, TaskStatus) = optional(tx.query_row(
            "SELECT agent_id, status FROM tasks WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))?
        .ok_or_else(|| Error::not_found("task", id))?;

        if !current.can_transition_to(outcome.status) {
            return Err(Error::invalid_transition("task", current, outcome.status));
        }

        let now = now_ts();
        tx.execute(
            "UPDATE tasks SET status = ?2, error = ?3, duration_secs = ?4,
                              started_at = COALESCE(started_at, ?5), completed_at = ?5
             WHERE id = ?1",
            params![id, outcome.status, outcome.error, outcome.duration_secs, now],
        )?;
        rollup_agent(&tx, agent_id)?;
        tx.commit()?;

        debug!(task_id = %id, status = %outcome.status, agent_id, "Task finished");
        self.get_task(id)?.ok_or_else(|| Error::not_found("task", id))
    }

    pub fn increment_task_retry(&self, id: &str) -> Result<i64> {
        let changed = self.conn.execute(
            "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("task", id));
        }
        let count = self.conn.query_row(
            "SELECT retry_count FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
