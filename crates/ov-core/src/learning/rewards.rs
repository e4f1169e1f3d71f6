//! Reward issuance for finished tasks and sessions

use tracing::debug;

use super::LearningController;
use crate::Result;
use crate::store::{EntityRef, Reward, Session, SessionStatus, Store, Task, TaskStatus};

impl LearningController {
    /// Reward a finished task. Unfinished tasks earn nothing.
    pub fn reward_task(&self, store: &Store, task: &Task) -> Result<Option<Reward>> {
        let rewards = &self.config.rewards;
        let (amount, reason) = match task.status {
            TaskStatus::Completed => (rewards.task_completed, "task completed"),
            TaskStatus::Failed => (rewards.task_failed, "task failed"),
            _ => return Ok(None),
        };
        let reward = store.record_reward(&EntityRef::task(&task.id), amount, reason)?;
        store.record_reward(&EntityRef::agent(task.agent_id), amount, reason)?;
        debug!(task_id = %task.id, amount, "Task rewarded");
        Ok(Some(reward))
    }

    /// Reward a session that reached a terminal state. A completed session
    /// with a pull request counts as merged.
    pub fn reward_session(&self, store: &Store, session: &Session) -> Result<Option<Reward>> {
        let rewards = &self.config.rewards;
        let (amount, reason) = match session.status {
            SessionStatus::Completed if session.pr_url.is_some() => {
                (rewards.session_merged, "session completed with merged pull request")
            }
            SessionStatus::Completed => (rewards.session_completed, "session completed"),
            SessionStatus::Blocked => (rewards.session_blocked, "session blocked"),
            SessionStatus::Failed => (rewards.session_failed, "session failed"),
            _ => return Ok(None),
        };
        let reward = store.record_reward(&EntityRef::session(&session.id), amount, reason)?;
        debug!(session_id = %session.id, amount, "Session rewarded");
        Ok(Some(reward))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewAgent, NewSession, NewTask, SessionOutcome, TaskOutcome, REWARD_METRIC};

    fn setup() -> (Store, Session, i64) {
        let store = Store::in_memory().unwrap();
        let team = store.create_team("engineering", "software", None).unwrap();
        let agent = store.create_agent(&NewAgent::new(team.id, "builder", "engineer")).unwrap();
        let session = store
            .create_session(&NewSession {
                team_id: team.id,
                ..Default::default()
            })
            .unwrap();
        store.start_session(&session.id).unwrap();
        (store, session, agent.id)
    }

    #[test]
    fn test_task_rewards() {
        let (store, session, agent_id) = setup();
        let controller = LearningController::default();
        let task = store
            .create_task(&NewTask {
                session_id: session.id.clone(),
                agent_id,
                description: "write tests".to_string(),
                tier_used: None,
            })
            .unwrap();
        assert!(controller.reward_task(&store, &task).unwrap().is_none());

        let done = store.complete_task(&task.id, &TaskOutcome::failed("red")).unwrap();
        let reward = controller.reward_task(&store, &done).unwrap().unwrap();
        assert_eq!(reward.amount, -5);
        assert_eq!(store.reward_total(&EntityRef::agent(agent_id)).unwrap(), -5);
        assert_eq!(
            store
                .list_metrics(&EntityRef::task(&task.id), Some(REWARD_METRIC))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_merged_session_earns_more() {
        let (store, session, _) = setup();
        let controller = LearningController::default();
        let mut outcome = SessionOutcome::new(SessionStatus::Completed);
        outcome.pr_url = Some("https://example.com/pr/9".to_string());
        let finished = store.finish_session(&session.id, &outcome).unwrap();

        let reward = controller.reward_session(&store, &finished).unwrap().unwrap();
        assert_eq!(reward.amount, 100);
    }

    #[test]
    fn test_blocked_session_penalty_is_milder_than_failure() {
        let (store, session, _) = setup();
        let controller = LearningController::default();
        let finished = store
            .finish_session(&session.id, &SessionOutcome::new(SessionStatus::Blocked))
            .unwrap();
        let reward = controller.reward_session(&store, &finished).unwrap().unwrap();
        assert_eq!(reward.amount, -10);
        assert!(reward.amount > controller.config().rewards.session_failed);
    }
}
