//! Execution tiers and the tier selection policy

use serde::{Deserialize, Serialize};

use super::complexity::Complexity;
use super::TaskSpec;
use crate::config::{TierPricing, TokenBuckets, TokenEstimate};
use crate::store::types::sql_enum;

sql_enum! {
    /// Cost/quality level a task runs at
    pub enum ExecutionTier {
        Premium => "premium",
        Balanced => "balanced",
        Fast => "fast",
        Local => "local",
    }
}

impl ExecutionTier {
    /// Fixed ranking used when comparing tiers. Higher is stronger.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Premium => 4,
            Self::Balanced => 3,
            Self::Fast => 2,
            Self::Local => 1,
        }
    }

    pub fn all() -> [ExecutionTier; 4] {
        [Self::Premium, Self::Balanced, Self::Fast, Self::Local]
    }
}

sql_enum! {
    /// Coarse token budget bucket for cost planning
    pub enum TokenRequirement {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

impl TokenRequirement {
    /// Bucket implied by complexity when the caller gives none.
    pub fn for_complexity(complexity: Complexity) -> Self {
        match complexity {
            Complexity::Simple => Self::Low,
            Complexity::Medium => Self::Medium,
            Complexity::High | Complexity::Architecture => Self::High,
        }
    }

    pub fn estimate(&self, buckets: &TokenBuckets) -> TokenEstimate {
        match self {
            Self::Low => buckets.low,
            Self::Medium => buckets.medium,
            Self::High => buckets.high,
        }
    }
}

/// Result of tier selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSelection {
    pub tier: ExecutionTier,
    pub reason: String,
    pub tokens: TokenEstimate,
    pub cost_estimate: f64,
}

/// Planning estimate in currency units. Not a metered value.
pub fn estimate_cost(pricing: &TierPricing, tier: ExecutionTier, tokens: TokenEstimate) -> f64 {
    let price = pricing.price(tier);
    (tokens.input as f64 * price.input_per_million + tokens.output as f64 * price.output_per_million)
        / 1_000_000.0
}

/// Pick a tier. Rules are checked in order; the first match wins.
pub fn select_execution_tier(
    spec: &TaskSpec,
    complexity: Complexity,
    pricing: &TierPricing,
    buckets: &TokenBuckets,
) -> TierSelection {
    let requirement = spec
        .token_requirement
        .unwrap_or_else(|| TokenRequirement::for_complexity(complexity));
    let creative = spec.needs_creativity();

    let (tier, reason) = if spec.critical || complexity == Complexity::Architecture {
        (
            ExecutionTier::Premium,
            if spec.critical {
                "critical task forces the top tier".to_string()
            } else {
                "architecture work forces the top tier".to_string()
            },
        )
    } else if requirement == TokenRequirement::High && complexity == Complexity::Simple {
        (
            ExecutionTier::Local,
            "simple task with a large token budget runs locally".to_string(),
        )
    } else if complexity == Complexity::Simple && !creative {
        (
            ExecutionTier::Fast,
            "simple task without creative needs uses the fast tier".to_string(),
        )
    } else if creative || complexity == Complexity::High {
        (
            ExecutionTier::Premium,
            if creative {
                "creative work uses the top tier".to_string()
            } else {
                "high complexity uses the top tier".to_string()
            },
        )
    } else {
        (ExecutionTier::Balanced, "default balanced tier".to_string())
    };

    let tokens = requirement.estimate(buckets);
    TierSelection {
        tier,
        reason,
        tokens,
        cost_estimate: estimate_cost(pricing, tier, tokens),
    }
}

/// Override a selected tier with an agent's preference, upward only.
///
/// Returns the (possibly unchanged) selection and whether the preference
/// was applied.
pub fn apply_preference(
    selection: &TierSelection,
    preference: Option<ExecutionTier>,
    respect: bool,
    pricing: &TierPricing,
) -> (TierSelection, bool) {
    match preference {
        Some(preferred) if respect && preferred.rank() >= selection.tier.rank() => {
            let mut updated = selection.clone();
            if preferred != selection.tier {
                updated.reason = format!(
                    "{}; raised to {} by agent preference",
                    selection.reason, preferred
                );
            }
            updated.tier = preferred;
            updated.cost_estimate = estimate_cost(pricing, preferred, updated.tokens);
            (updated, true)
        }
        _ => (selection.clone(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(description: &str) -> TaskSpec {
        TaskSpec::new(description)
    }

    fn select(spec: &TaskSpec, complexity: Complexity) -> TierSelection {
        select_execution_tier(spec, complexity, &TierPricing::default(), &TokenBuckets::default())
    }

    #[test]
    fn test_rank_table() {
        let ranks: Vec<u8> = ExecutionTier::all().iter().map(|t| t.rank()).collect();
        assert_eq!(ranks, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_critical_beats_everything() {
        let mut s = spec("fix typo");
        s.critical = true;
        s.token_requirement = Some(TokenRequirement::High);
        assert_eq!(select(&s, Complexity::Simple).tier, ExecutionTier::Premium);
    }

    #[test]
    fn test_precedence_order() {
        assert_eq!(
            select(&spec("x"), Complexity::Architecture).tier,
            ExecutionTier::Premium
        );

        let mut big = spec("x");
        big.token_requirement = Some(TokenRequirement::High);
        assert_eq!(select(&big, Complexity::Simple).tier, ExecutionTier::Local);

        assert_eq!(select(&spec("x"), Complexity::Simple).tier, ExecutionTier::Fast);

        let mut creative = spec("x");
        creative.creativity = true;
        assert_eq!(select(&creative, Complexity::Simple).tier, ExecutionTier::Premium);
        assert_eq!(select(&creative, Complexity::Medium).tier, ExecutionTier::Premium);

        assert_eq!(select(&spec("x"), Complexity::High).tier, ExecutionTier::Premium);
        assert_eq!(select(&spec("x"), Complexity::Medium).tier, ExecutionTier::Balanced);
    }

    #[test]
    fn test_tier_override_bound() {
        let mut s = spec("rotate production keys");
        s.critical = true;
        let pricing = TierPricing::default();
        let selection = select(&s, Complexity::Medium);
        assert_eq!(selection.tier, ExecutionTier::Premium);

        let (after, applied) = apply_preference(&selection, Some(ExecutionTier::Local), true, &pricing);
        assert!(!applied);
        assert_eq!(after.tier, ExecutionTier::Premium);
    }

    #[test]
    fn test_preference_can_raise() {
        let pricing = TierPricing::default();
        let selection = select(&spec("x"), Complexity::Medium);
        let (after, applied) =
            apply_preference(&selection, Some(ExecutionTier::Premium), true, &pricing);
        assert!(applied);
        assert_eq!(after.tier, ExecutionTier::Premium);
        assert!(after.cost_estimate > selection.cost_estimate);

        let (ignored, applied) =
            apply_preference(&selection, Some(ExecutionTier::Premium), false, &pricing);
        assert!(!applied);
        assert_eq!(ignored.tier, ExecutionTier::Balanced);
    }

    #[test]
    fn test_zero_cost_local_estimate() {
        let pricing = TierPricing::default();
        let tokens = TokenRequirement::Medium.estimate(&TokenBuckets::default());
        let cost = estimate_cost(&pricing, ExecutionTier::Local, tokens);
        assert_eq!(cost, 0.0);
        assert_eq!(format!("{:.2}", cost), "0.00");
    }

    #[test]
    fn test_balanced_medium_estimate() {
        let pricing = TierPricing::default();
        let tokens = TokenRequirement::Medium.estimate(&TokenBuckets::default());
        // 4000 * 3 / 1M + 2000 * 15 / 1M
        let cost = estimate_cost(&pricing, ExecutionTier::Balanced, tokens);
        assert!((cost - 0.042).abs() < 1e-12);
    }
}
