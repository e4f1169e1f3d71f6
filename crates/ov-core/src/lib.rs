//! ov-core: Overseer control plane core library
//!
//! Holds the pieces every other crate builds on: the SQLite state store,
//! the task/model router, the adaptive decision engine (learning controller)
//! and the pattern/repetition detector, plus configuration and the shared
//! error taxonomy.

pub mod config;
pub mod error;
pub mod learning;
pub mod patterns;
pub mod router;
pub mod store;

pub use config::{
    ApiConfig, Config, LearningConfig, PatternConfig, RewardConfig, RouterConfig, SchedulerConfig,
    StoreConfig, SupervisorConfig, WorkflowExecutables,
};
pub use error::{Error, Result};
pub use learning::{AgentInsight, ExperimentEvaluation, LearningController, Recommendation};
pub use patterns::{ActionablePatterns, PatternDetector};
pub use router::{ExecutionTier, RoutingDecision, RoutingPlan, TaskRouter, TaskSpec, TierSelection};
pub use store::{SharedStore, Store};
