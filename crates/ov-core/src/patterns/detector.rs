//! Success/failure pattern tracking and command repetition analysis

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::normalize::{normalize_intent, pattern_slug, slugify};
use crate::config::PatternConfig;
use crate::store::{
    Agent, AutomationCandidate, CandidateStatus, Decision, EntityRef, Pattern, PatternDetection,
    PatternStatus, PatternType, Store, UserCommand,
};
use crate::{Error, Result};

/// A pattern worth acting on, with the recommended action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionablePattern {
    pub pattern: Pattern,
    pub action: Decision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionablePatterns {
    pub successes: Vec<ActionablePattern>,
    pub failures: Vec<ActionablePattern>,
}

impl ActionablePatterns {
    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.failures.is_empty()
    }
}

/// Absorbs float drift from repeated confidence steps
const CONFIDENCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default)]
pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    fn detect(
        &self,
        store: &Store,
        pattern_type: PatternType,
        description: &str,
        entity: &EntityRef,
    ) -> Result<Pattern> {
        if description.trim().is_empty() {
            return Err(Error::Validation("pattern description must not be empty".to_string()));
        }
        let slug = pattern_slug(pattern_type, entity.entity_type, description);
        let pattern = store.upsert_pattern(&PatternDetection {
            slug: &slug,
            pattern_type,
            entity_type: entity.entity_type,
            entity_id: Some(entity.entity_id.as_str()),
            description,
            initial_confidence: self.config.initial_confidence,
            confidence_step: self.config.confidence_step,
        })?;
        debug!(
            slug = %pattern.slug,
            detections = pattern.detection_count,
            confidence = pattern.confidence,
            "Pattern detected"
        );
        Ok(pattern)
    }

    pub fn detect_success(&self, store: &Store, description: &str, entity: &EntityRef) -> Result<Pattern> {
        self.detect(store, PatternType::Success, description, entity)
    }

    pub fn detect_failure(&self, store: &Store, description: &str, entity: &EntityRef) -> Result<Pattern> {
        self.detect(store, PatternType::Failure, description, entity)
    }

    fn is_actionable(&self, pattern: &Pattern) -> bool {
        let floor = match pattern.pattern_type {
            PatternType::Success => self.config.success_confidence_floor,
            PatternType::Failure => self.config.failure_confidence_floor,
            PatternType::UserRepetition => return false,
        };
        matches!(pattern.status, PatternStatus::Active | PatternStatus::Verified)
            && pattern.detection_count >= i64::from(self.config.actionable_min_detections)
            && pattern.confidence + CONFIDENCE_EPSILON >= floor
    }

    /// Patterns seen often enough and with enough confidence to act on.
    pub fn get_actionable(&self, store: &Store) -> Result<ActionablePatterns> {
        let mut actionable = ActionablePatterns::default();
        for pattern in store.list_patterns(None, None)? {
            if !self.is_actionable(&pattern) {
                continue;
            }
            match pattern.pattern_type {
                PatternType::Success => actionable.successes.push(ActionablePattern {
                    pattern,
                    action: Decision::DoubleDown,
                }),
                PatternType::Failure => actionable.failures.push(ActionablePattern {
                    pattern,
                    action: Decision::Kill,
                }),
                PatternType::UserRepetition => {}
            }
        }
        Ok(actionable)
    }

    /// Normalize and append a human command to the command log.
    pub fn log_command(&self, store: &Store, command: &str) -> Result<UserCommand> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::Validation("command must not be empty".to_string()));
        }
        store.log_user_command(command, &normalize_intent(command))
    }

    /// Confidence for a candidate seen `occurrences` times
    pub fn candidate_confidence(&self, occurrences: i64) -> f64 {
        (self.config.candidate_confidence_per_occurrence * occurrences as f64).min(1.0)
    }

    /// Turn every intent repeated enough within the window into a pending
    /// automation candidate. Rescans update the existing row.
    pub fn analyze_command_repetition(&self, store: &Store) -> Result<Vec<AutomationCandidate>> {
        let since = Utc::now() - Duration::days(self.config.window_days);
        let groups = store.command_repetitions_since(
            &since,
            self.config.min_repetitions,
            self.config.max_sample_commands,
        )?;

        let mut candidates = Vec::new();
        for group in groups {
            let candidate = store.upsert_candidate(
                &group.intent,
                &group.sample_commands,
                group.occurrences,
                self.candidate_confidence(group.occurrences),
            )?;
            if candidate.status == CandidateStatus::Pending {
                candidates.push(candidate);
            }
        }

        if !candidates.is_empty() {
            info!("{} automation candidate(s) pending review", candidates.len());
        }
        Ok(candidates)
    }

    /// Approve a candidate into a new agent of `team_name`.
    pub fn approve_candidate(
        &self,
        store: &Store,
        candidate_id: i64,
        team_name: &str,
    ) -> Result<(AutomationCandidate, Agent)> {
        let team = store
            .get_team_by_name(team_name)?
            .ok_or_else(|| Error::not_found("team", team_name))?;
        let candidate = store
            .get_candidate(candidate_id)?
            .ok_or_else(|| Error::not_found("automation candidate", candidate_id))?;

        let agent_name = format!("{}-agent", slugify(&candidate.intent));
        let role = format!("automation: {}", candidate.intent);
        store.approve_candidate(candidate_id, team.id, &agent_name, &role)
    }

    pub fn dismiss_candidate(&self, store: &Store, candidate_id: i64) -> Result<AutomationCandidate> {
        store.dismiss_candidate(candidate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityType;

    fn agent_ref() -> EntityRef {
        EntityRef::agent(1)
    }

    #[test]
    fn test_repeat_detection_reinforces() {
        let store = Store::in_memory().unwrap();
        let detector = PatternDetector::default();

        let first = detector.detect_success(&store, "Clean merges", &agent_ref()).unwrap();
        let second = detector.detect_success(&store, "clean merges", &agent_ref()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.detection_count, 2);

        let failure = detector.detect_failure(&store, "Clean merges", &agent_ref()).unwrap();
        assert_ne!(failure.id, first.id);
    }

    #[test]
    fn test_actionable_thresholds() {
        let store = Store::in_memory().unwrap();
        let detector = PatternDetector::default();
        let entity = EntityRef::new(EntityType::Team, 1);

        // three detections: 0.5 -> 0.6 -> 0.7
        for _ in 0..3 {
            detector.detect_success(&store, "ships on time", &entity).unwrap();
            detector.detect_failure(&store, "flaky deploys", &entity).unwrap();
        }
        let actionable = detector.get_actionable(&store).unwrap();
        assert_eq!(actionable.successes.len(), 1);
        assert_eq!(actionable.failures.len(), 1);
        assert_eq!(actionable.successes[0].action, Decision::DoubleDown);
        assert_eq!(actionable.failures[0].action, Decision::Kill);

        // two detections are never actionable
        detector.detect_failure(&store, "slow builds", &entity).unwrap();
        detector.detect_failure(&store, "slow builds", &entity).unwrap();
        assert_eq!(detector.get_actionable(&store).unwrap().failures.len(), 1);
    }

    #[test]
    fn test_success_floor_is_stricter() {
        let store = Store::in_memory().unwrap();
        let detector = PatternDetector::new(PatternConfig {
            initial_confidence: 0.45,
            ..PatternConfig::default()
        });
        let entity = EntityRef::new(EntityType::Team, 1);
        // three detections reach 0.65: above the failure floor, below the success floor
        for _ in 0..3 {
            detector.detect_success(&store, "good", &entity).unwrap();
            detector.detect_failure(&store, "bad", &entity).unwrap();
        }
        let actionable = detector.get_actionable(&store).unwrap();
        assert!(actionable.successes.is_empty());
        assert_eq!(actionable.failures.len(), 1);
    }

    #[test]
    fn test_repetition_threshold() {
        let store = Store::in_memory().unwrap();
        let detector = PatternDetector::default();

        detector.log_command(&store, "deploy staging").unwrap();
        detector.log_command(&store, "please deploy staging").unwrap();
        assert!(detector.analyze_command_repetition(&store).unwrap().is_empty());
        assert!(store.list_candidates(None).unwrap().is_empty());

        detector.log_command(&store, "deploy staging now").unwrap();
        let found = detector.analyze_command_repetition(&store).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].occurrence_count, 3);
        assert!((found[0].confidence - 0.6).abs() < 1e-9);

        detector.log_command(&store, "deploy staging").unwrap();
        detector.analyze_command_repetition(&store).unwrap();
        let all = store.list_candidates(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].occurrence_count, 4);
        assert!((all[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_candidate_confidence_capped() {
        let detector = PatternDetector::default();
        assert_eq!(detector.candidate_confidence(10), 1.0);
    }

    #[test]
    fn test_approve_through_detector() {
        let store = Store::in_memory().unwrap();
        store.create_team("engineering", "software", None).unwrap();
        let detector = PatternDetector::default();
        for _ in 0..3 {
            detector.log_command(&store, "rotate api keys").unwrap();
        }
        let candidate = detector.analyze_command_repetition(&store).unwrap().remove(0);

        let (approved, agent) = detector
            .approve_candidate(&store, candidate.id, "engineering")
            .unwrap();
        assert_eq!(agent.name, "rotate-api-keys-agent");
        assert_eq!(approved.agent_id, Some(agent.id));
        assert!(detector.approve_candidate(&store, candidate.id, "engineering").is_err());

        // approved candidates drop out of later scans
        assert!(detector.analyze_command_repetition(&store).unwrap().is_empty());
    }

    #[test]
    fn test_empty_command_rejected() {
        let store = Store::in_memory().unwrap();
        let detector = PatternDetector::default();
        assert!(matches!(
            detector.log_command(&store, "   "),
            Err(Error::Validation(_))
        ));
    }
}
