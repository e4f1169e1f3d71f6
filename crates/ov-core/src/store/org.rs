//! Teams, agents, and the marketing rows the store holds on behalf of
//! outer layers

use rusqlite::{Row, params};
use tracing::{debug, info};

use super::{Store, json_col, now_ts, optional, ts_col};
use super::types::{Agent, Campaign, Lead, NewAgent, Team};
use crate::router::ExecutionTier;
use crate::{Error, Result};

const AGENT_COLUMNS: &str = "id, team_id, name, role, glyph, preferred_tier, is_active, success_rate,
     total_tasks_completed, total_tasks_failed, avg_duration_secs, created_at, updated_at";

fn team_from_row(row: &Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        description: row.get(3)?,
        created_at: ts_col(row, 4)?,
    })
}

pub(crate) fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        team_id: row.get(1)?,
        name: row.get(2)?,
        role: row.get(3)?,
        glyph: row.get(4)?,
        preferred_tier: row.get(5)?,
        is_active: row.get(6)?,
        success_rate: row.get(7)?,
        total_tasks_completed: row.get(8)?,
        total_tasks_failed: row.get(9)?,
        avg_duration_secs: row.get(10)?,
        created_at: ts_col(row, 11)?,
        updated_at: ts_col(row, 12)?,
    })
}

impl Store {
    pub fn create_team(&self, name: &str, domain: &str, description: Option<&str>) -> Result<Team> {
        if name.trim().is_empty() {
            return Err(Error::Validation("team name must not be empty".to_string()));
        }
        self.conn
            .execute(
                "INSERT INTO teams (name, domain, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, domain, description, now_ts()],
            )
            .map_err(|e| Error::from_sqlite(e, "create team"))?;

        let id = self.conn.last_insert_rowid();
        info!(team = name, "Created team {}", id);
        self.get_team(id)?.ok_or_else(|| Error::not_found("team", id))
    }

    pub fn get_team(&self, id: i64) -> Result<Option<Team>> {
        optional(self.conn.query_row(
            "SELECT id, name, domain, description, created_at FROM teams WHERE id = ?1",
            params![id],
            team_from_row,
        ))
    }

    pub fn get_team_by_name(&self, name: &str) -> Result<Option<Team>> {
        optional(self.conn.query_row(
            "SELECT id, name, domain, description, created_at FROM teams WHERE name = ?1",
            params![name],
            team_from_row,
        ))
    }

    pub fn list_teams(&self) -> Result<Vec<Team>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, domain, description, created_at FROM teams ORDER BY id")?;
        let teams = stmt
            .query_map([], team_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(teams)
    }

    pub fn update_team_description(&self, id: i64, description: Option<&str>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE teams SET description = ?1 WHERE id = ?2",
            params![description, id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("team", id));
        }
        Ok(())
    }

    pub fn create_agent(&self, agent: &NewAgent) -> Result<Agent> {
        if agent.name.trim().is_empty() {
            return Err(Error::Validation("agent name must not be empty".to_string()));
        }
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO agents (team_id, name, role, glyph, preferred_tier, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    agent.team_id,
                    agent.name,
                    agent.role,
                    agent.glyph,
                    agent.preferred_tier,
                    now
                ],
            )
            .map_err(|e| Error::from_sqlite(e, "create agent"))?;

        let id = self.conn.last_insert_rowid();
        info!(agent = %agent.name, team_id = agent.team_id, "Created agent {}", id);
        self.get_agent(id)?.ok_or_else(|| Error::not_found("agent", id))
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<Agent>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
            params![id],
            agent_from_row,
        ))
    }

    pub fn get_agent_by_name(&self, name: &str) -> Result<Option<Agent>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLUMNS),
            params![name],
            agent_from_row,
        ))
    }

    /// List agents, optionally restricted to one team and to active ones.
    pub fn list_agents(&self, team_id: Option<i64>, active_only: bool) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM agents
             WHERE (?1 IS NULL OR team_id = ?1) AND (?2 = 0 OR is_active = 1)
             ORDER BY id",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map(params![team_id, active_only], agent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    /// Hire, fire or rehire. Agents are never deleted.
    pub fn set_agent_active(&self, id: i64, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE agents SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, now_ts(), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("agent", id));
        }
        debug!(agent_id = id, active, "Agent activity changed");
        Ok(())
    }

    pub fn set_agent_preferred_tier(&self, id: i64, tier: Option<ExecutionTier>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE agents SET preferred_tier = ?1, updated_at = ?2 WHERE id = ?3",
            params![tier, now_ts(), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("agent", id));
        }
        Ok(())
    }

    pub fn create_campaign(
        &self,
        team_id: i64,
        name: &str,
        status: &str,
        payload: &serde_json::Value,
    ) -> Result<Campaign> {
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO campaigns (team_id, name, status, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![team_id, name, status, serde_json::to_string(payload)?, now],
            )
            .map_err(|e| Error::from_sqlite(e, "create campaign"))?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, team_id, name, status, payload, created_at FROM campaigns WHERE id = ?1",
                params![id],
                campaign_from_row,
            )
            .map_err(Error::from)
    }

    pub fn list_campaigns(&self, team_id: Option<i64>) -> Result<Vec<Campaign>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, team_id, name, status, payload, created_at FROM campaigns
             WHERE ?1 IS NULL OR team_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![team_id], campaign_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn create_lead(
        &self,
        campaign_id: Option<i64>,
        name: &str,
        status: &str,
        payload: &serde_json::Value,
    ) -> Result<Lead> {
        self.conn
            .execute(
                "INSERT INTO leads (campaign_id, name, status, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![campaign_id, name, status, serde_json::to_string(payload)?, now_ts()],
            )
            .map_err(|e| Error::from_sqlite(e, "create lead"))?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, campaign_id, name, status, payload, created_at FROM leads WHERE id = ?1",
                params![id],
                lead_from_row,
            )
            .map_err(Error::from)
    }

    pub fn list_leads(&self, campaign_id: Option<i64>) -> Result<Vec<Lead>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, campaign_id, name, status, payload, created_at FROM leads
             WHERE ?1 IS NULL OR campaign_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![campaign_id], lead_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: row.get(0)?,
        team_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        payload: json_col(row, 4)?,
        created_at: ts_col(row, 5)?,
    })
}

fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        payload: json_col(row, 4)?,
        created_at: ts_col(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_get_team() {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        assert_eq!(team.name, "engineering");

        let by_name = store.get_team_by_name("engineering").unwrap().unwrap();
        assert_eq!(by_name.id, team.id);
        assert!(store.get_team(999).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_team_is_constraint_violation() {
        let store = Store::in_memory().unwrap();
        store.create_team("research", "research", None).unwrap();
        let err = store.create_team("research", "research", None).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn test_agent_requires_existing_team() {
        let store = Store::in_memory().unwrap();
        let err = store.create_agent(&NewAgent::new(42, "ghost", "engineer")).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
        assert!(store.list_teams().unwrap().is_empty());
    }

    #[test]
    fn test_fire_and_rehire_agent() {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        let agent = store
            .create_agent(
                &NewAgent::new(team.id, "builder", "backend engineer")
                    .with_preferred_tier(ExecutionTier::Balanced),
            )
            .unwrap();
        assert!(agent.is_active);
        assert_eq!(agent.preferred_tier, Some(ExecutionTier::Balanced));

        store.set_agent_active(agent.id, false).unwrap();
        assert!(store.list_agents(Some(team.id), true).unwrap().is_empty());
        assert_eq!(store.list_agents(Some(team.id), false).unwrap().len(), 1);

        store.set_agent_active(agent.id, true).unwrap();
        assert_eq!(store.list_agents(None, true).unwrap().len(), 1);

        assert!(matches!(
            store.set_agent_active(999, true),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_campaigns_and_leads() {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("marketing", "growth", None).unwrap();
        let campaign = store
            .create_campaign(team.id, "launch", "draft", &json!({"channel": "email"}))
            .unwrap();
        assert_eq!(campaign.payload["channel"], "email");

        store
            .create_lead(Some(campaign.id), "acme", "new", &json!({}))
            .unwrap();
        assert_eq!(store.list_leads(Some(campaign.id)).unwrap().len(), 1);
        assert_eq!(store.list_campaigns(None).unwrap().len(), 1);
    }
}
