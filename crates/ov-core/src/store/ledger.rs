//! Append-only ledgers: metrics, rewards, usage and the user command log

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde_json::Value;
use tracing::debug;

use super::types::{CostBreakdown, EntityRef, Metric, NewUsage, Reward, UsageRecord, UserCommand};
use super::{Store, now_ts, ts, ts_col};
use crate::{Error, Result};

/// Metric name under which every reward is mirrored
pub const REWARD_METRIC: &str = "reward";

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<Metric> {
    let context: Option<String> = row.get(5)?;
    let context = context
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(Metric {
        id: row.get(0)?,
        entity: EntityRef {
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
        },
        name: row.get(3)?,
        value: row.get(4)?,
        context,
        recorded_at: ts_col(row, 6)?,
    })
}

fn reward_from_row(row: &Row<'_>) -> rusqlite::Result<Reward> {
    Ok(Reward {
        id: row.get(0)?,
        entity: EntityRef {
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
        },
        amount: row.get(3)?,
        reason: row.get(4)?,
        created_at: ts_col(row, 5)?,
    })
}

fn cost_from_row(row: &Row<'_>) -> rusqlite::Result<CostBreakdown> {
    Ok(CostBreakdown {
        key: row.get(0)?,
        invocations: row.get(1)?,
        input_tokens: row.get(2)?,
        output_tokens: row.get(3)?,
        total_cost: row.get(4)?,
    })
}

impl Store {
    pub fn record_metric(
        &self,
        entity: &EntityRef,
        name: &str,
        value: f64,
        context: Option<&Value>,
    ) -> Result<Metric> {
        if !value.is_finite() {
            return Err(Error::Validation(format!("metric '{}' value must be finite", name)));
        }
        let context = context.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO metrics (entity_type, entity_id, name, value, context, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![entity.entity_type, entity.entity_id, name, value, context, now_ts()],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(entity = %entity, metric = name, value, "Recorded metric");

        self.conn
            .query_row(
                "SELECT id, entity_type, entity_id, name, value, context, recorded_at
                 FROM metrics WHERE id = ?1",
                params![id],
                metric_from_row,
            )
            .map_err(Error::from)
    }

    /// Metrics for an entity, oldest first.
    pub fn list_metrics(&self, entity: &EntityRef, name: Option<&str>) -> Result<Vec<Metric>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, entity_id, name, value, context, recorded_at
             FROM metrics
             WHERE entity_type = ?1 AND entity_id = ?2 AND (?3 IS NULL OR name = ?3)
             ORDER BY id",
        )?;
        let metrics = stmt
            .query_map(params![entity.entity_type, entity.entity_id, name], metric_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }

    /// Insert a reward and its mirror metric in one transaction.
    pub fn record_reward(&self, entity: &EntityRef, amount: i64, reason: &str) -> Result<Reward> {
        let now = now_ts();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO rewards (entity_type, entity_id, amount, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity.entity_type, entity.entity_id, amount, reason, now],
        )?;
        let id = tx.last_insert_rowid();
        let context = serde_json::json!({ "reason": reason, "reward_id": id }).to_string();
        tx.execute(
            "INSERT INTO metrics (entity_type, entity_id, name, value, context, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entity.entity_type,
                entity.entity_id,
                REWARD_METRIC,
                amount as f64,
                context,
                now
            ],
        )?;
        tx.commit()?;

        debug!(entity = %entity, amount, reason, "Issued reward");
        self.conn
            .query_row(
                "SELECT id, entity_type, entity_id, amount, reason, created_at FROM rewards WHERE id = ?1",
                params![id],
                reward_from_row,
            )
            .map_err(Error::from)
    }

    pub fn list_rewards(&self, entity: &EntityRef) -> Result<Vec<Reward>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, entity_id, amount, reason, created_at
             FROM rewards WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id",
        )?;
        let rewards = stmt
            .query_map(params![entity.entity_type, entity.entity_id], reward_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rewards)
    }

    pub fn reward_total(&self, entity: &EntityRef) -> Result<i64> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM rewards WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity.entity_type, entity.entity_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Append a human command with its normalized intent.
    pub fn log_user_command(&self, command: &str, intent: &str) -> Result<UserCommand> {
        self.log_user_command_at(command, intent, &Utc::now())
    }

    pub(crate) fn log_user_command_at(
        &self,
        command: &str,
        intent: &str,
        at: &DateTime<Utc>,
    ) -> Result<UserCommand> {
        self.conn.execute(
            "INSERT INTO user_commands (command, intent, created_at) VALUES (?1, ?2, ?3)",
            params![command, intent, ts(at)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, command, intent, created_at FROM user_commands WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserCommand {
                        id: row.get(0)?,
                        command: row.get(1)?,
                        intent: row.get(2)?,
                        created_at: ts_col(row, 3)?,
                    })
                },
            )
            .map_err(Error::from)
    }

    pub fn record_usage(&self, usage: &NewUsage) -> Result<UsageRecord> {
        if usage.input_tokens < 0 || usage.output_tokens < 0 || usage.duration_ms < 0 {
            return Err(Error::Validation("usage counters must not be negative".to_string()));
        }
        self.conn
            .execute(
                "INSERT INTO usage_records (task_id, agent_id, tier, input_tokens, output_tokens,
                                            duration_ms, cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    usage.task_id,
                    usage.agent_id,
                    usage.tier,
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.duration_ms,
                    usage.cost,
                    now_ts()
                ],
            )
            .map_err(|e| Error::from_sqlite(e, "record usage"))?;
        let id = self.conn.last_insert_rowid();

        self.conn
            .query_row(
                "SELECT id, task_id, agent_id, tier, input_tokens, output_tokens, duration_ms,
                        cost, created_at
                 FROM usage_records WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UsageRecord {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        tier: row.get(3)?,
                        input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                        duration_ms: row.get(6)?,
                        cost: row.get(7)?,
                        created_at: ts_col(row, 8)?,
                    })
                },
            )
            .map_err(Error::from)
    }

    pub fn cost_by_tier(&self, since: Option<&DateTime<Utc>>) -> Result<Vec<CostBreakdown>> {
        let mut stmt = self.conn.prepare(
            "SELECT tier, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(cost)
             FROM usage_records
             WHERE ?1 IS NULL OR created_at >= ?1
             GROUP BY tier
             ORDER BY SUM(cost) DESC, tier",
        )?;
        let rows = stmt
            .query_map(params![since.map(ts)], cost_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn cost_by_agent(&self, since: Option<&DateTime<Utc>>) -> Result<Vec<CostBreakdown>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(a.name, 'unassigned'), COUNT(*), SUM(u.input_tokens),
                    SUM(u.output_tokens), SUM(u.cost)
             FROM usage_records u
             LEFT JOIN agents a ON a.id = u.agent_id
             WHERE ?1 IS NULL OR u.created_at >= ?1
             GROUP BY COALESCE(a.name, 'unassigned')
             ORDER BY SUM(u.cost) DESC, 1",
        )?;
        let rows = stmt
            .query_map(params![since.map(ts)], cost_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ExecutionTier;
    use crate::store::types::{EntityType, NewAgent};

    #[test]
    fn test_reward_is_mirrored_as_metric() {
        let store = Store::in_memory().unwrap();
        let entity = EntityRef::session("s-1");
        store.record_reward(&entity, 50, "session completed").unwrap();
        store.record_reward(&entity, -10, "session blocked").unwrap();

        assert_eq!(store.reward_total(&entity).unwrap(), 40);
        assert_eq!(store.list_rewards(&entity).unwrap().len(), 2);

        let mirrored = store.list_metrics(&entity, Some(REWARD_METRIC)).unwrap();
        assert_eq!(mirrored.len(), 2);
        assert_eq!(mirrored[0].value, 50.0);
        assert_eq!(mirrored[1].value, -10.0);
    }

    #[test]
    fn test_metric_context_round_trips() {
        let store = Store::in_memory().unwrap();
        let entity = EntityRef::new(EntityType::Team, 1);
        let ctx = serde_json::json!({"source": "test"});
        store.record_metric(&entity, "latency", 1.5, Some(&ctx)).unwrap();

        let metrics = store.list_metrics(&entity, None).unwrap();
        assert_eq!(metrics[0].context.as_ref().unwrap()["source"], "test");
        assert!(store.record_metric(&entity, "bad", f64::NAN, None).is_err());
    }

    #[test]
    fn test_cost_reports() {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        let agent = store.create_agent(&NewAgent::new(team.id, "builder", "engineer")).unwrap();

        let usage = |tier, cost, agent_id| NewUsage {
            task_id: None,
            agent_id,
            tier,
            input_tokens: 1000,
            output_tokens: 500,
            duration_ms: 1200,
            cost,
        };
        store.record_usage(&usage(ExecutionTier::Premium, 0.05, Some(agent.id))).unwrap();
        store.record_usage(&usage(ExecutionTier::Premium, 0.05, Some(agent.id))).unwrap();
        store.record_usage(&usage(ExecutionTier::Local, 0.0, None)).unwrap();

        let by_tier = store.cost_by_tier(None).unwrap();
        assert_eq!(by_tier[0].key, "premium");
        assert_eq!(by_tier[0].invocations, 2);
        assert!((by_tier[0].total_cost - 0.10).abs() < 1e-9);

        let by_agent = store.cost_by_agent(None).unwrap();
        assert_eq!(by_agent.len(), 2);
        assert_eq!(by_agent[0].key, "builder");
        assert_eq!(by_agent[1].key, "unassigned");
    }

    #[test]
    fn test_usage_rejects_unknown_agent() {
        let store = Store::in_memory().unwrap();
        let err = store
            .record_usage(&NewUsage {
                task_id: None,
                agent_id: Some(77),
                tier: ExecutionTier::Fast,
                input_tokens: 1,
                output_tokens: 1,
                duration_ms: 1,
                cost: 0.0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }
}
