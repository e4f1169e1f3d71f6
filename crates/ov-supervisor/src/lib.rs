//! ov-supervisor: worker process supervision for the Overseer control plane
//!
//! Launches one OS process per job, captures its output, persists a
//! manifest per job so a restarted supervisor can recover, and feeds
//! finished jobs back into the store through reconciliation.

pub mod control;
pub mod job;
mod logbuf;
pub mod manifest;
pub mod process;
pub mod reconcile;
pub mod spec;
mod supervisor;

pub use control::{ControlPlane, CostReport, PatternScan, Submission};
pub use job::{JobEvent, JobHandle, JobState, JobStatus, LaunchContext};
pub use reconcile::{ReconcileOutcome, ReconcileReport, Reconciler, WorkerArtifact};
pub use spec::{JobRequest, JobSpec, Workflow, WorkflowKind};
pub use supervisor::Supervisor;
