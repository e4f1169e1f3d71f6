//! Task/model router
//!
//! Picks a team and agent for a piece of work, then an execution tier and
//! a planning cost estimate. Pricing and keyword tables live on the
//! [`TaskRouter`] instance.

pub mod complexity;
mod routing;
pub mod tier;

pub use complexity::{Complexity, classify};
pub use routing::{RoutingDecision, RoutingPlan, TaskRouter, UsageInput};
pub use tier::{ExecutionTier, TierSelection, TokenRequirement, estimate_cost};

use serde::{Deserialize, Serialize};

/// Work to be routed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    /// Explicit complexity, skipping keyword classification
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub creativity: bool,
    #[serde(default)]
    pub token_requirement: Option<TokenRequirement>,
    /// Team name, skipping domain keyword matching
    #[serde(default)]
    pub team: Option<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            complexity: None,
            critical: false,
            creativity: false,
            token_requirement: None,
            team: None,
        }
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn needs_creativity(&self) -> bool {
        self.creativity || complexity::mentions_creativity(&self.description)
    }
}
