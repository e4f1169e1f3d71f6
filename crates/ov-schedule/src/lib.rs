//! Scheduled maintenance
//!
//! Runs control-plane housekeeping on cron schedules: reconciling finished
//! jobs, scanning for patterns and evaluating experiments.

mod config;
mod error;
mod scheduler;

pub use config::{MaintenanceAction, ScheduleConfig, ScheduleTask};
pub use error::{Result, ScheduleError};
pub use scheduler::{MaintenanceTarget, Scheduler, SchedulerHandle};
