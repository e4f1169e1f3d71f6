//! Adaptive decision engine
//!
//! Issues rewards for finished work, evaluates experiments with the
//! keep/kill/double-down policy, and turns session outcomes into patterns.
//! Missing evidence is a `continue`, never an error.

mod analysis;
mod experiments;
mod rewards;

pub use analysis::{AgentInsight, Recommendation, SessionAnalysis};
pub use experiments::{ExperimentEvaluation, OUTCOME_METRIC, decide};

use crate::config::LearningConfig;
use crate::patterns::PatternDetector;

/// Learning controller. Holds policy; state lives in the store.
#[derive(Debug, Clone, Default)]
pub struct LearningController {
    config: LearningConfig,
    patterns: PatternDetector,
}

impl LearningController {
    pub fn new(config: LearningConfig, patterns: PatternDetector) -> Self {
        Self { config, patterns }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn patterns(&self) -> &PatternDetector {
        &self.patterns
    }
}
