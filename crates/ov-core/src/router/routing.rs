//! Team and agent assignment

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::TaskSpec;
use super::complexity::{self, Complexity};
use super::tier::{self, ExecutionTier, TierSelection};
use crate::config::RouterConfig;
use crate::store::{Agent, NewAgent, NewUsage, Store, Team, UsageRecord};
use crate::{Error, Result};

/// Team and agent chosen for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub team: Team,
    /// None when the team has no active agents
    pub agent: Option<Agent>,
    pub complexity: Complexity,
    pub reasoning: Vec<String>,
}

/// Routing plus the tier it will run at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPlan {
    pub routing: RoutingDecision,
    pub selection: TierSelection,
    pub preference_applied: bool,
}

impl RoutingPlan {
    pub fn tier(&self) -> ExecutionTier {
        self.selection.tier
    }
}

/// One actual invocation to be written to the usage ledger
#[derive(Debug, Clone)]
pub struct UsageInput {
    pub task_id: Option<String>,
    pub agent_id: Option<i64>,
    pub tier: ExecutionTier,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

/// Router owning its pricing and keyword tables
#[derive(Debug, Clone)]
pub struct TaskRouter {
    config: RouterConfig,
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl TaskRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn classify(&self, spec: &TaskSpec) -> Complexity {
        complexity::classify(&spec.description, spec.complexity)
    }

    /// Team whose domain keywords best match the description.
    fn match_team(&self, description: &str) -> (String, String) {
        let tokens = complexity::words(description);
        let best = self
            .config
            .teams
            .iter()
            .map(|route| {
                let hits = route
                    .keywords
                    .iter()
                    .filter(|k| tokens.iter().any(|t| t == &k.to_lowercase()))
                    .count();
                (route, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            // first team wins ties
            .fold(None, |best: Option<(&_, usize)>, (route, hits)| match best {
                Some((_, top)) if top >= hits => best,
                _ => Some((route, hits)),
            });

        match best {
            Some((route, hits)) => (
                route.team.clone(),
                format!("team '{}' matched {} domain keyword(s)", route.team, hits),
            ),
            None => (
                self.config.default_team.clone(),
                format!("no domain keywords matched, using default team '{}'", self.config.default_team),
            ),
        }
    }

    fn generalist_for(&self, team: &str) -> Option<&str> {
        self.config
            .teams
            .iter()
            .find(|route| route.team == team)
            .and_then(|route| route.generalist.as_deref())
    }

    /// Choose the team, then the agent whose role best overlaps the description.
    pub fn route_task(&self, store: &Store, spec: &TaskSpec) -> Result<RoutingDecision> {
        let complexity = self.classify(spec);
        let mut reasoning = vec![format!("classified as {} complexity", complexity)];

        let team_name = match &spec.team {
            Some(team) => {
                reasoning.push(format!("team '{}' requested explicitly", team));
                team.clone()
            }
            None => {
                let (team, why) = self.match_team(&spec.description);
                reasoning.push(why);
                team
            }
        };
        let team = store
            .get_team_by_name(&team_name)?
            .ok_or_else(|| Error::not_found("team", &team_name))?;

        let agents = store.list_agents(Some(team.id), true)?;
        let tokens: Vec<String> = complexity::words(&spec.description.replace('-', " "))
            .into_iter()
            .filter(|t| t.len() >= 3)
            .collect();

        let scored = agents
            .iter()
            .map(|agent| {
                let profile = complexity::words(&format!("{} {}", agent.name, agent.role).replace('-', " "));
                let score = tokens.iter().filter(|t| profile.contains(t)).count();
                (agent, score)
            })
            .filter(|(_, score)| *score > 0)
            .fold(None, |best: Option<(&Agent, usize)>, (agent, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((agent, score)),
            });

        let agent = if let Some((agent, score)) = scored {
            reasoning.push(format!(
                "agent '{}' role matched {} specialty keyword(s)",
                agent.name, score
            ));
            Some(agent.clone())
        } else if let Some(generalist) = self
            .generalist_for(&team.name)
            .and_then(|name| agents.iter().find(|a| a.name == name))
        {
            reasoning.push(format!("no specialist matched, using generalist '{}'", generalist.name));
            Some(generalist.clone())
        } else if let Some(first) = agents.first() {
            reasoning.push(format!("no specialist matched, using first active agent '{}'", first.name));
            Some(first.clone())
        } else {
            reasoning.push(format!("team '{}' has no active agents", team.name));
            None
        };

        debug!(team = %team.name, agent = ?agent.as_ref().map(|a| &a.name), "Routed task");
        Ok(RoutingDecision {
            team,
            agent,
            complexity,
            reasoning,
        })
    }

    pub fn select_execution_tier(&self, spec: &TaskSpec) -> TierSelection {
        tier::select_execution_tier(
            spec,
            self.classify(spec),
            &self.config.pricing,
            &self.config.token_buckets,
        )
    }

    /// Apply the routed agent's stored tier preference. Only ever raises the tier.
    pub fn apply_agent_preference(&self, plan: RoutingPlan, respect: bool) -> RoutingPlan {
        let preference = plan.routing.agent.as_ref().and_then(|a| a.preferred_tier);
        let (selection, applied) =
            tier::apply_preference(&plan.selection, preference, respect, &self.config.pricing);
        if preference.is_some() && !applied && respect {
            debug!(
                tier = %plan.selection.tier,
                "Agent preference would lower the tier, ignored"
            );
        }
        RoutingPlan {
            routing: plan.routing,
            selection,
            preference_applied: plan.preference_applied || applied,
        }
    }

    /// Route, select a tier and honor the agent's preference.
    pub fn plan(&self, store: &Store, spec: &TaskSpec) -> Result<RoutingPlan> {
        let routing = self.route_task(store, spec)?;
        let selection = self.select_execution_tier(spec);
        let plan = RoutingPlan {
            routing,
            selection,
            preference_applied: false,
        };
        Ok(self.apply_agent_preference(plan, true))
    }

    /// Write one invocation to the usage ledger, priced at the tier's rates.
    pub fn record_usage(&self, store: &Store, usage: &UsageInput) -> Result<UsageRecord> {
        let cost = tier::estimate_cost(
            &self.config.pricing,
            usage.tier,
            crate::config::TokenEstimate {
                input: usage.input_tokens,
                output: usage.output_tokens,
            },
        );
        store.record_usage(&NewUsage {
            task_id: usage.task_id.clone(),
            agent_id: usage.agent_id,
            tier: usage.tier,
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            duration_ms: usage.duration_ms as i64,
            cost,
        })
    }

    /// Create any configured team or generalist agent that is missing.
    pub fn seed_organization(&self, store: &Store) -> Result<()> {
        for route in &self.config.teams {
            let team = match store.get_team_by_name(&route.team)? {
                Some(team) => team,
                None => store.create_team(&route.team, &route.team, None)?,
            };
            if let Some(generalist) = &route.generalist {
                if store.get_agent_by_name(generalist)?.is_none() {
                    store.create_agent(&NewAgent::new(team.id, generalist, "generalist"))?;
                    info!(team = %route.team, agent = %generalist, "Seeded generalist agent");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::TokenRequirement;

    fn seeded() -> (Store, TaskRouter) {
        let store = Store::in_memory().unwrap();
        let router = TaskRouter::default();
        router.seed_organization(&store).unwrap();
        (store, router)
    }

    #[test]
    fn test_seed_is_idempotent() {
        let (store, router) = seeded();
        router.seed_organization(&store).unwrap();
        assert_eq!(store.list_teams().unwrap().len(), 3);
        assert_eq!(store.list_agents(None, false).unwrap().len(), 3);
    }

    #[test]
    fn test_route_by_domain_keywords() {
        let (store, router) = seeded();
        let decision = router
            .route_task(&store, &TaskSpec::new("Draft the newsletter for the spring campaign"))
            .unwrap();
        assert_eq!(decision.team.name, "marketing");
        assert_eq!(decision.agent.unwrap().name, "marketer");
        assert!(!decision.reasoning.is_empty());
    }

    #[test]
    fn test_default_team_when_nothing_matches() {
        let (store, router) = seeded();
        let decision = router.route_task(&store, &TaskSpec::new("hello there")).unwrap();
        assert_eq!(decision.team.name, "engineering");
    }

    #[test]
    fn test_specialist_beats_generalist() {
        let (store, router) = seeded();
        let team = store.get_team_by_name("engineering").unwrap().unwrap();
        store
            .create_agent(&NewAgent::new(team.id, "dba", "database migration specialist"))
            .unwrap();

        let decision = router
            .route_task(&store, &TaskSpec::new("Fix the database migration bug"))
            .unwrap();
        assert_eq!(decision.agent.unwrap().name, "dba");
    }

    #[test]
    fn test_unknown_team_is_not_found() {
        let (store, router) = seeded();
        let err = router
            .route_task(&store, &TaskSpec::new("x").with_team("legal"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_plan_applies_preference_upward_only() {
        let (store, router) = seeded();
        let engineer = store.get_agent_by_name("engineer").unwrap().unwrap();
        store
            .set_agent_preferred_tier(engineer.id, Some(ExecutionTier::Local))
            .unwrap();

        let mut spec = TaskSpec::new("Rotate the deploy keys").with_team("engineering");
        spec.critical = true;
        let plan = router.plan(&store, &spec).unwrap();
        assert_eq!(plan.tier(), ExecutionTier::Premium);
        assert!(!plan.preference_applied);
    }

    #[test]
    fn test_record_usage_prices_local_at_zero() {
        let (store, router) = seeded();
        let mut spec = TaskSpec::new("bulk rename of fixtures");
        spec.token_requirement = Some(TokenRequirement::Medium);
        spec.complexity = Some(Complexity::Simple);

        let record = router
            .record_usage(
                &store,
                &UsageInput {
                    task_id: None,
                    agent_id: None,
                    tier: ExecutionTier::Local,
                    input_tokens: 4_000,
                    output_tokens: 2_000,
                    duration_ms: 900,
                },
            )
            .unwrap();
        assert_eq!(record.cost, 0.0);
        assert_eq!(router.select_execution_tier(&spec).tier, ExecutionTier::Fast);
    }
}
