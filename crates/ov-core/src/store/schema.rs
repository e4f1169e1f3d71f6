//! Database schema and migrations
//!
//! Migrations are applied in order and tracked with `PRAGMA user_version`.
//! Immutability rules from the data model (append-only ledgers, final
//! lifecycle states) are enforced with triggers so no code path can bypass
//! them.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::Result;

const V1_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    domain      TEXT NOT NULL,
    description TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id               INTEGER NOT NULL REFERENCES teams(id),
    name                  TEXT NOT NULL UNIQUE,
    role                  TEXT NOT NULL,
    glyph                 TEXT NOT NULL DEFAULT '*',
    preferred_tier        TEXT,
    is_active             INTEGER NOT NULL DEFAULT 1,
    success_rate          REAL NOT NULL DEFAULT 0,
    total_tasks_completed INTEGER NOT NULL DEFAULT 0,
    total_tasks_failed    INTEGER NOT NULL DEFAULT 0,
    avg_duration_secs     REAL,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_team ON agents(team_id);

CREATE TABLE IF NOT EXISTS sessions (
    id                TEXT PRIMARY KEY,
    team_id           INTEGER NOT NULL REFERENCES teams(id),
    job_id            TEXT UNIQUE,
    target_repository TEXT,
    priority_input    TEXT,
    branch_name       TEXT,
    pr_url            TEXT,
    status            TEXT NOT NULL DEFAULT 'pending'
                      CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'blocked')),
    iterations        INTEGER NOT NULL DEFAULT 0,
    started_at        TEXT,
    completed_at      TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL REFERENCES sessions(id),
    agent_id      INTEGER NOT NULL REFERENCES agents(id),
    description   TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending'
                  CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'blocked')),
    tier_used     TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    error         TEXT,
    duration_secs REAL,
    started_at    TEXT,
    completed_at  TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);
CREATE INDEX IF NOT EXISTS idx_tasks_agent_status ON tasks(agent_id, status);

CREATE TABLE IF NOT EXISTS metrics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    name        TEXT NOT NULL,
    value       REAL NOT NULL,
    context     TEXT,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_entity ON metrics(entity_type, entity_id, name);

CREATE TABLE IF NOT EXISTS rewards (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    amount      INTEGER NOT NULL,
    reason      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rewards_entity ON rewards(entity_type, entity_id);

CREATE TABLE IF NOT EXISTS experiments (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    name                 TEXT NOT NULL UNIQUE,
    hypothesis           TEXT NOT NULL,
    target_metric        TEXT NOT NULL,
    target_value         REAL,
    current_value        REAL,
    sample_size          INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    status               TEXT NOT NULL DEFAULT 'active'
                         CHECK (status IN ('active', 'successful', 'failed', 'killed')),
    decision             TEXT CHECK (decision IN ('keep', 'kill', 'double_down', 'continue')),
    decision_reason      TEXT,
    decided_at           TEXT,
    created_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS patterns (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    slug            TEXT NOT NULL UNIQUE,
    pattern_type    TEXT NOT NULL CHECK (pattern_type IN ('success', 'failure', 'user_repetition')),
    entity_type     TEXT NOT NULL,
    entity_id       TEXT,
    description     TEXT NOT NULL,
    detection_count INTEGER NOT NULL DEFAULT 1,
    confidence      REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
    status          TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'verified', 'false_positive', 'actioned')),
    first_detected  TEXT NOT NULL,
    last_detected   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS automation_candidates (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    intent           TEXT NOT NULL UNIQUE,
    sample_commands  TEXT NOT NULL,
    occurrence_count INTEGER NOT NULL,
    confidence       REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'approved', 'dismissed')),
    agent_id         INTEGER REFERENCES agents(id),
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_commands (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    command    TEXT NOT NULL,
    intent     TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_commands_intent ON user_commands(intent, created_at);

CREATE TABLE IF NOT EXISTS usage_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id       TEXT REFERENCES tasks(id),
    agent_id      INTEGER REFERENCES agents(id),
    tier          TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    duration_ms   INTEGER NOT NULL,
    cost          REAL NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaigns (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id    INTEGER NOT NULL REFERENCES teams(id),
    name       TEXT NOT NULL,
    status     TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS leads (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER REFERENCES campaigns(id),
    name        TEXT NOT NULL,
    status      TEXT NOT NULL,
    payload     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
"#;

const V1_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS teams_identity_fixed
BEFORE UPDATE OF name, domain ON teams
WHEN NEW.name != OLD.name OR NEW.domain != OLD.domain
BEGIN
    SELECT RAISE(ABORT, 'team name and domain are immutable');
END;

CREATE TRIGGER IF NOT EXISTS agents_never_deleted
BEFORE DELETE ON agents
BEGIN
    SELECT RAISE(ABORT, 'agents are deactivated, never deleted');
END;

CREATE TRIGGER IF NOT EXISTS sessions_terminal_final
BEFORE UPDATE OF status ON sessions
WHEN OLD.status IN ('completed', 'failed', 'blocked') AND NEW.status != OLD.status
BEGIN
    SELECT RAISE(ABORT, 'session already reached a terminal state');
END;

CREATE TRIGGER IF NOT EXISTS tasks_terminal_final
BEFORE UPDATE OF status ON tasks
WHEN OLD.status IN ('completed', 'failed') AND NEW.status != OLD.status
BEGIN
    SELECT RAISE(ABORT, 'task already finished');
END;

CREATE TRIGGER IF NOT EXISTS metrics_no_update BEFORE UPDATE ON metrics
BEGIN SELECT RAISE(ABORT, 'metrics are append-only'); END;
CREATE TRIGGER IF NOT EXISTS metrics_no_delete BEFORE DELETE ON metrics
BEGIN SELECT RAISE(ABORT, 'metrics are append-only'); END;

CREATE TRIGGER IF NOT EXISTS rewards_no_update BEFORE UPDATE ON rewards
BEGIN SELECT RAISE(ABORT, 'rewards are append-only'); END;
CREATE TRIGGER IF NOT EXISTS rewards_no_delete BEFORE DELETE ON rewards
BEGIN SELECT RAISE(ABORT, 'rewards are append-only'); END;

CREATE TRIGGER IF NOT EXISTS usage_no_update BEFORE UPDATE ON usage_records
BEGIN SELECT RAISE(ABORT, 'usage records are append-only'); END;
CREATE TRIGGER IF NOT EXISTS usage_no_delete BEFORE DELETE ON usage_records
BEGIN SELECT RAISE(ABORT, 'usage records are append-only'); END;

CREATE TRIGGER IF NOT EXISTS user_commands_no_update BEFORE UPDATE ON user_commands
BEGIN SELECT RAISE(ABORT, 'command log is append-only'); END;

CREATE TRIGGER IF NOT EXISTS experiments_frozen
BEFORE UPDATE ON experiments
WHEN OLD.status != 'active'
BEGIN
    SELECT RAISE(ABORT, 'experiment is no longer active');
END;

CREATE TRIGGER IF NOT EXISTS candidates_frozen
BEFORE UPDATE ON automation_candidates
WHEN OLD.status = 'approved'
BEGIN
    SELECT RAISE(ABORT, 'automation candidate already approved');
END;
"#;

const V1_VIEWS: &str = r#"
CREATE VIEW IF NOT EXISTS active_sessions AS
SELECT s.id AS session_id,
       t.name AS team,
       s.status,
       s.job_id,
       COUNT(k.id) AS task_count,
       COUNT(DISTINCT k.agent_id) AS agent_count,
       s.created_at
FROM sessions s
JOIN teams t ON t.id = s.team_id
LEFT JOIN tasks k ON k.session_id = s.id
WHERE s.status IN ('pending', 'in_progress')
GROUP BY s.id;

CREATE VIEW IF NOT EXISTS agent_performance AS
SELECT a.id AS agent_id,
       a.name AS agent,
       t.name AS team,
       a.is_active,
       a.total_tasks_completed AS completed,
       a.total_tasks_failed AS failed,
       CASE WHEN a.total_tasks_completed + a.total_tasks_failed = 0 THEN 0.0
            ELSE ROUND(100.0 * a.total_tasks_completed
                       / (a.total_tasks_completed + a.total_tasks_failed), 1)
       END AS success_pct,
       a.avg_duration_secs
FROM agents a
JOIN teams t ON t.id = a.team_id;

CREATE VIEW IF NOT EXISTS agent_leaderboard AS
SELECT * FROM agent_performance
WHERE is_active = 1
ORDER BY success_pct DESC, completed DESC, agent ASC;

CREATE VIEW IF NOT EXISTS experiment_summary AS
SELECT status,
       COUNT(*) AS experiments,
       AVG(current_value) AS avg_current_value
FROM experiments
GROUP BY status;

CREATE VIEW IF NOT EXISTS command_repetitions AS
SELECT intent,
       COUNT(*) AS occurrences,
       MIN(created_at) AS first_seen,
       MAX(created_at) AS last_seen
FROM user_commands
WHERE created_at >= strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-7 days')
GROUP BY intent
HAVING COUNT(*) >= 3;
"#;

/// Ordered migrations; index + 1 is the schema version they produce.
const MIGRATIONS: &[&[&str]] = &[&[V1_TABLES, V1_TRIGGERS, V1_VIEWS]];

/// Latest schema version
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Bring the database up to the latest schema version.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current >= SCHEMA_VERSION {
        debug!("Schema up to date (version {})", current);
        return Ok(());
    }

    for (index, steps) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i64 + 1;
        let tx = conn.unchecked_transaction()?;
        for sql in steps.iter() {
            tx.execute_batch(sql)?;
        }
        tx.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        tx.commit()?;
        info!("Applied schema migration v{}", version);
    }

    Ok(())
}
