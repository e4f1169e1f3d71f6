//! Scheduler
//!
//! Runs each enabled maintenance task on its cron schedule until stopped.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule as CronSchedule;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ov_supervisor::ControlPlane;

use crate::config::{MaintenanceAction, ScheduleConfig, ScheduleTask};
use crate::error::{Result, ScheduleError};

/// Something maintenance actions can run against
#[async_trait]
pub trait MaintenanceTarget: Send + Sync {
    /// Run one action and return a one-line summary
    async fn run(&self, action: MaintenanceAction) -> anyhow::Result<String>;
}

#[async_trait]
impl MaintenanceTarget for ControlPlane {
    async fn run(&self, action: MaintenanceAction) -> anyhow::Result<String> {
        match action {
            MaintenanceAction::ReconcileJobs => {
                let reconciled = self.reconcile_finished().await?;
                Ok(format!("{} job(s) reconciled", reconciled.len()))
            }
            MaintenanceAction::DetectPatterns => {
                let scan = self.run_pattern_detection()?;
                Ok(format!(
                    "{} success / {} failure pattern(s) actionable, {} candidate(s) pending",
                    scan.actionable.successes.len(),
                    scan.actionable.failures.len(),
                    scan.candidates.len()
                ))
            }
            MaintenanceAction::EvaluateExperiments => {
                let evaluations = self.evaluate_experiments()?;
                Ok(format!("{} experiment(s) evaluated", evaluations.len()))
            }
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

pub struct Scheduler {
    tasks: Vec<(ScheduleTask, CronSchedule)>,
    target: Arc<dyn MaintenanceTarget>,
}

impl Scheduler {
    /// Validate every enabled task's cron expression up front.
    pub fn new(config: &ScheduleConfig, target: Arc<dyn MaintenanceTarget>) -> Result<Self> {
        let tasks = config
            .enabled_tasks()
            .into_iter()
            .map(|task| Ok((task.clone(), parse_cron(task)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tasks, target })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let shutdown_tx_clone = shutdown_tx.clone();

        let handle = tokio::spawn(async move {
            info!("Scheduler started ({} task(s))", self.tasks.len());

            let mut task_handles = Vec::new();
            for (task, schedule) in self.tasks {
                let target = Arc::clone(&self.target);
                let mut rx = shutdown_rx.resubscribe();
                task_handles.push(tokio::spawn(async move {
                    run_schedule_task(task, schedule, target, &mut rx).await;
                }));
            }

            for handle in task_handles {
                let _ = handle.await;
            }

            info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown_tx: shutdown_tx_clone,
            handle,
        }
    }
}

async fn run_schedule_task(
    task: ScheduleTask,
    schedule: CronSchedule,
    target: Arc<dyn MaintenanceTarget>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    info!(task = %task.name, cron = %task.cron, action = %task.action, "Schedule task registered");

    loop {
        let now = Utc::now();
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(task = %task.name, "No upcoming run time");
            break;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                match target.run(task.action).await {
                    Ok(summary) => info!(task = %task.name, "{}", summary),
                    Err(e) => error!(task = %task.name, "Maintenance failed: {:#}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!(task = %task.name, "Shutdown requested");
                break;
            }
        }
    }
}

fn parse_cron(task: &ScheduleTask) -> Result<CronSchedule> {
    CronSchedule::from_str(&task.cron).map_err(|source| ScheduleError::CronParse {
        task: task.name.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl MaintenanceTarget for Counter {
        async fn run(&self, _action: MaintenanceAction) -> anyhow::Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails, scheduler keeps going")
        }
    }

    #[test]
    fn test_parse_cron() {
        let task = ScheduleTask::new("t", "0 */15 * * * *", MaintenanceAction::ReconcileJobs);
        assert!(parse_cron(&task).is_ok());
    }

    #[test]
    fn test_invalid_cron_fails_construction() {
        let config = ScheduleConfig {
            schedules: vec![ScheduleTask::new("bad", "invalid", MaintenanceAction::DetectPatterns)],
        };
        let err = Scheduler::new(&config, Arc::new(Counter::default())).err().unwrap();
        assert!(matches!(err, ScheduleError::CronParse { ref task, .. } if task == "bad"));
    }

    #[test]
    fn test_disabled_tasks_are_skipped() {
        let mut task = ScheduleTask::new("off", "invalid", MaintenanceAction::DetectPatterns);
        task.enabled = false;
        let config = ScheduleConfig { schedules: vec![task] };
        let scheduler = Scheduler::new(&config, Arc::new(Counter::default())).unwrap();
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_runs_until_stopped() {
        let counter = Arc::new(Counter::default());
        let config = ScheduleConfig {
            schedules: vec![ScheduleTask::new(
                "every second",
                "* * * * * *",
                MaintenanceAction::EvaluateExperiments,
            )],
        };
        let handle = Scheduler::new(&config, counter.clone()).unwrap().start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.stop().await;

        let runs = counter.runs.load(Ordering::SeqCst);
        assert!(runs >= 1, "ran {runs} times");
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(counter.runs.load(Ordering::SeqCst), runs);
    }
}
