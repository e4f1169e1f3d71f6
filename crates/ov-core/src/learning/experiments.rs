//! Keep/kill/double-down evaluation of experiments

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::LearningController;
use crate::config::LearningConfig;
use crate::store::{
    Decision, EntityRef, Experiment, ExperimentDecision, ExperimentStatus, Metric, Reward, Store,
};
use crate::{Error, Result};

/// Metric recorded on an experiment for every attempt (1.0 success, 0.0 failure)
pub const OUTCOME_METRIC: &str = "outcome";

/// Result of evaluating one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvaluation {
    pub experiment: Experiment,
    pub successes: i64,
    pub failures: i64,
    pub decision: ExperimentDecision,
    pub reward: Option<Reward>,
}

/// Apply the decision rules to outcomes listed newest first.
///
/// Rules, first match wins:
/// 1. a failure streak of `kill_consecutive_failures` kills
/// 2. enough attempts at or above `double_down_success_rate` doubles down
/// 3. enough attempts below `stagnant_success_rate` kills as stagnant
/// 4. anything else continues
pub fn decide(newest_first: &[bool], config: &LearningConfig) -> ExperimentDecision {
    let total = newest_first.len() as i64;
    let successes = newest_first.iter().filter(|ok| **ok).count() as i64;
    let streak = newest_first.iter().take_while(|ok| !**ok).count() as i64;
    let rate = if total == 0 {
        0.0
    } else {
        successes as f64 / total as f64
    };
    let enough = total >= i64::from(config.min_sample_size);

    let (decision, reason) = if streak >= i64::from(config.kill_consecutive_failures) {
        (Decision::Kill, format!("{} consecutive failures", streak))
    } else if enough && rate >= config.double_down_success_rate {
        (
            Decision::DoubleDown,
            format!("{:.0}% success over {} attempts", rate * 100.0, total),
        )
    } else if enough && rate < config.stagnant_success_rate {
        (
            Decision::Kill,
            format!("stagnant: {:.0}% success over {} attempts", rate * 100.0, total),
        )
    } else if total == 0 {
        (Decision::Continue, "no outcomes recorded yet".to_string())
    } else {
        (
            Decision::Continue,
            format!("{:.0}% success over {} attempts", rate * 100.0, total),
        )
    };

    ExperimentDecision {
        current_value: rate,
        sample_size: total,
        consecutive_failures: streak,
        decision,
        reason,
    }
}

fn is_success(metric: &Metric) -> bool {
    metric.value >= 0.5
}

impl LearningController {
    /// Append one attempt outcome to an active experiment.
    pub fn record_experiment_outcome(
        &self,
        store: &Store,
        experiment_id: i64,
        success: bool,
        context: Option<&serde_json::Value>,
    ) -> Result<Metric> {
        let experiment = store
            .get_experiment(experiment_id)?
            .ok_or_else(|| Error::not_found("experiment", experiment_id))?;
        if experiment.status != ExperimentStatus::Active {
            return Err(Error::invalid_transition(
                "experiment",
                experiment.status,
                "outcome recorded",
            ));
        }
        store.record_metric(
            &EntityRef::experiment(experiment_id),
            OUTCOME_METRIC,
            if success { 1.0 } else { 0.0 },
            context,
        )
    }

    /// Evaluate one active experiment and write the decision.
    pub fn evaluate_experiment(&self, store: &Store, experiment_id: i64) -> Result<ExperimentEvaluation> {
        let entity = EntityRef::experiment(experiment_id);
        let outcomes: Vec<bool> = store
            .list_metrics(&entity, Some(OUTCOME_METRIC))?
            .iter()
            .rev()
            .map(is_success)
            .collect();
        let decision = decide(&outcomes, &self.config);
        let experiment = store.write_experiment_decision(experiment_id, &decision)?;

        let rewards = &self.config.rewards;
        let reward = match decision.decision {
            Decision::Kill => Some(store.record_reward(
                &entity,
                rewards.experiment_killed,
                &format!("experiment killed: {}", decision.reason),
            )?),
            Decision::DoubleDown => Some(store.record_reward(
                &entity,
                rewards.experiment_double_down,
                &format!("experiment doubled down: {}", decision.reason),
            )?),
            Decision::Keep | Decision::Continue => None,
        };

        let successes = outcomes.iter().filter(|ok| **ok).count() as i64;
        info!(
            experiment = %experiment.name,
            decision = %decision.decision,
            reason = %decision.reason,
            "Experiment evaluated"
        );
        Ok(ExperimentEvaluation {
            experiment,
            successes,
            failures: outcomes.len() as i64 - successes,
            decision,
            reward,
        })
    }

    /// Evaluate every active experiment. One failing row does not stop the batch.
    pub fn evaluate_all_active(&self, store: &Store) -> Result<Vec<ExperimentEvaluation>> {
        let mut results = Vec::new();
        for experiment in store.list_experiments(Some(ExperimentStatus::Active))? {
            match self.evaluate_experiment(store, experiment.id) {
                Ok(evaluation) => results.push(evaluation),
                Err(e) => warn!(experiment_id = experiment.id, "Evaluation failed: {}", e),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(oldest_first: &[bool]) -> Vec<bool> {
        oldest_first.iter().rev().copied().collect()
    }

    #[test]
    fn test_kill_precedence() {
        let config = LearningConfig::default();
        // high overall rate, but the last three failed
        let mut history = vec![true; 30];
        history.extend([false, false, false]);
        let d = decide(&outcomes(&history), &config);
        assert_eq!(d.decision, Decision::Kill);
        assert_eq!(d.consecutive_failures, 3);
        assert!(d.reason.contains("consecutive"));

        history.extend([false; 7]);
        let d = decide(&outcomes(&history), &config);
        assert_eq!(d.decision, Decision::Kill);
        assert!(d.reason.contains("10 consecutive"));

        // fewer attempts than the sample gate still kill on a streak
        let d = decide(&outcomes(&[false, false, false]), &config);
        assert_eq!(d.decision, Decision::Kill);
        assert!(d.reason.contains("consecutive"));
    }

    #[test]
    fn test_double_down_boundary() {
        let config = LearningConfig::default();
        let mut nine_of_ten = vec![false];
        nine_of_ten.extend([true; 9]);
        let d = decide(&outcomes(&nine_of_ten), &config);
        assert_eq!(d.decision, Decision::DoubleDown);
        assert_eq!(d.sample_size, 10);

        let d = decide(&outcomes(&[true; 5]), &config);
        assert_eq!(d.decision, Decision::DoubleDown);

        // sample-size gate binds before the rate gate
        let d = decide(&outcomes(&[true; 4]), &config);
        assert_eq!(d.decision, Decision::Continue);
    }

    #[test]
    fn test_stagnant_kill_is_distinct() {
        let config = LearningConfig::default();
        let history = [false, false, true, false, false, true, false, false, true, false, true, true];
        // 5/12 is not stagnant
        assert_eq!(decide(&outcomes(&history), &config).decision, Decision::Continue);

        let stagnant = [true, false, false, true, false, false, false, false, false, false, true];
        // streak of 0 at the end, 3/11 below 30%
        let d = decide(&outcomes(&stagnant), &config);
        assert_eq!(d.decision, Decision::Kill);
        assert!(d.reason.starts_with("stagnant"));
    }

    #[test]
    fn test_no_data_continues() {
        let d = decide(&[], &LearningConfig::default());
        assert_eq!(d.decision, Decision::Continue);
        assert_eq!(d.sample_size, 0);
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let config = LearningConfig {
            kill_consecutive_failures: 5,
            ..LearningConfig::default()
        };
        let d = decide(&outcomes(&[true, true, true, false, false, false]), &config);
        assert_eq!(d.decision, Decision::Continue);
    }

    #[test]
    fn test_evaluate_writes_decision_and_reward() {
        let store = Store::in_memory().unwrap();
        let controller = LearningController::default();
        let exp = store.create_experiment("e1", "h", OUTCOME_METRIC, None).unwrap();
        for ok in [true, true, true, true, true] {
            controller.record_experiment_outcome(&store, exp.id, ok, None).unwrap();
        }

        let evaluation = controller.evaluate_experiment(&store, exp.id).unwrap();
        assert_eq!(evaluation.decision.decision, Decision::DoubleDown);
        assert_eq!(evaluation.experiment.decision, Some(Decision::DoubleDown));
        assert_eq!(evaluation.reward.as_ref().unwrap().amount, 30);
        assert_eq!(evaluation.successes, 5);

        // the controller never changes status itself
        let row = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Active);
    }

    #[test]
    fn test_evaluate_all_active_skips_concluded() {
        let store = Store::in_memory().unwrap();
        let controller = LearningController::default();
        let a = store.create_experiment("a", "h", OUTCOME_METRIC, None).unwrap();
        let b = store.create_experiment("b", "h", OUTCOME_METRIC, None).unwrap();
        store.conclude_experiment(b.id, ExperimentStatus::Successful).unwrap();

        let results = controller.evaluate_all_active(&store).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].experiment.id, a.id);
        assert_eq!(results[0].decision.decision, Decision::Continue);
        assert!(results[0].reward.is_none());

        assert!(controller.record_experiment_outcome(&store, b.id, true, None).is_err());
    }
}
