//! Job supervisor
//!
//! Owns every worker process it launches. Each running job has a waiter
//! task that holds the child and alone decides its terminal state, plus two
//! pump tasks copying stdout/stderr into the log file and ring buffer.
//! Jobs found running in the manifest directory at startup are adopted by
//! pid and checked by polling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ov_core::config::SupervisorConfig;
use ov_core::{Error, Result};

use crate::job::{JobEvent, JobHandle, JobState, JobStatus, LaunchContext};
use crate::logbuf::LogRing;
use crate::manifest::JobLayout;
use crate::process::{self, OutputSink};
use crate::spec::{JobSpec, WorkflowKind};

const EVENT_CAPACITY: usize = 256;
const PUMP_DRAIN: Duration = Duration::from_secs(2);
const KILL_WAIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct JobEntry {
    status: Mutex<JobStatus>,
    logs: Arc<Mutex<LogRing>>,
    stop_requested: AtomicBool,
    finished: watch::Sender<bool>,
    /// Adopted from a previous run; no waiter task owns the process
    detached: bool,
}

impl JobEntry {
    fn new(status: JobStatus, ring_lines: usize, detached: bool) -> Self {
        let (finished, _) = watch::channel(status.state.is_terminal());
        Self {
            status: Mutex::new(status),
            logs: Arc::new(Mutex::new(LogRing::new(ring_lines))),
            stop_requested: AtomicBool::new(false),
            finished,
            detached,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, JobStatus>> {
        self.status
            .lock()
            .map_err(|_| Error::Other("job record lock poisoned".to_string()))
    }

    fn snapshot(&self) -> Result<JobStatus> {
        Ok(self.lock()?.clone())
    }

    fn mark_finished(&self) {
        self.finished.send_replace(true);
    }
}

/// Writes the manifest and publishes the event for a state change.
/// The in-memory record stays authoritative if the write fails.
#[derive(Clone)]
struct Recorder {
    layout: JobLayout,
    events: broadcast::Sender<JobEvent>,
}

impl Recorder {
    fn commit(&self, status: &JobStatus) {
        if let Err(e) = self.layout.write_manifest(status) {
            error!(job_id = %status.id, state = %status.state, "Failed to write manifest: {}", e);
        }
        // no subscribers is fine
        let _ = self.events.send(JobEvent::from(status));
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    recorder: Recorder,
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
    permits: Option<Arc<Semaphore>>,
}

impl Supervisor {
    /// Create the jobs directory and recover jobs left by a previous run.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.jobs_dir)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let supervisor = Self {
            recorder: Recorder {
                layout: JobLayout::new(&config.jobs_dir),
                events,
            },
            permits: config
                .max_concurrent_jobs
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
            jobs: RwLock::new(HashMap::new()),
            config,
        };
        supervisor.recover()?;
        Ok(supervisor)
    }

    /// Time-ordered job id
    pub fn new_job_id() -> String {
        Uuid::now_v7().to_string()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn layout(&self) -> &JobLayout {
        &self.recorder.layout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.recorder.events.subscribe()
    }

    fn recover(&self) -> Result<()> {
        let mut adopted = 0;
        let mut lost = 0;
        let mut jobs = self.write_jobs()?;
        for mut status in self.layout().scan()? {
            let unfinished = !status.state.is_terminal();
            if unfinished {
                match status.pid.filter(|pid| process::is_alive(*pid)) {
                    Some(pid) => {
                        info!(job_id = %status.id, pid, "Adopted running job from previous run");
                        adopted += 1;
                    }
                    None => {
                        status.error = Some("worker disappeared while the supervisor was down".to_string());
                        status.transition(JobState::Failed)?;
                        self.recorder.commit(&status);
                        warn!(job_id = %status.id, "Job lost during downtime, marked failed");
                        lost += 1;
                    }
                }
            }
            let detached = !status.state.is_terminal();
            let id = status.id.clone();
            jobs.insert(
                id,
                Arc::new(JobEntry::new(status, self.config.log_ring_lines, detached)),
            );
        }
        info!(jobs = jobs.len(), adopted, lost, "Recovered job manifests");
        Ok(())
    }

    fn read_jobs(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<JobEntry>>>> {
        self.jobs
            .read()
            .map_err(|_| Error::Other("job registry lock poisoned".to_string()))
    }

    fn write_jobs(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<JobEntry>>>> {
        self.jobs
            .write()
            .map_err(|_| Error::Other("job registry lock poisoned".to_string()))
    }

    fn entry(&self, id: &str) -> Result<Option<Arc<JobEntry>>> {
        Ok(self.read_jobs()?.get(id).cloned())
    }

    pub(crate) fn executable(&self, kind: WorkflowKind) -> Result<PathBuf> {
        let workers = &self.config.workers;
        let path = match kind {
            WorkflowKind::RepositoryEdit => workers.repository_edit.as_ref(),
            WorkflowKind::ContentWriting => workers.content_writing.as_ref(),
            WorkflowKind::Research => workers.research.as_ref(),
        };
        path.cloned()
            .ok_or_else(|| Error::Validation(format!("no worker executable configured for {}", kind)))
    }

    /// Launch a worker for `spec`. Returns once the process is running, or
    /// with `ProcessSpawn` after recording the job as failed.
    pub async fn start(&self, spec: &JobSpec, ctx: LaunchContext) -> Result<JobHandle> {
        let kind = spec.workflow.kind();
        let program = self.executable(kind)?;
        let id = ctx.job_id.clone().unwrap_or_else(Self::new_job_id);
        let args = spec.workflow.worker_args();

        let mut command_line = vec![program.display().to_string()];
        command_line.extend(args.iter().cloned());
        let status = JobStatus {
            id: id.clone(),
            workflow: kind,
            team: spec.team.clone(),
            state: JobState::Queued,
            session_id: ctx.session_id.clone(),
            agent_id: ctx.agent_id,
            tier: ctx.tier,
            command: command_line,
            pid: None,
            exit_code: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let entry = {
            let mut jobs = self.write_jobs()?;
            if jobs.contains_key(&id) || self.layout().manifest_path(&id).exists() {
                return Err(Error::Validation(format!("job id {} already exists", id)));
            }
            self.layout().write_manifest(&status)?;
            let entry = Arc::new(JobEntry::new(status.clone(), self.config.log_ring_lines, false));
            jobs.insert(id.clone(), Arc::clone(&entry));
            entry
        };
        let _ = self.recorder.events.send(JobEvent::from(&status));
        info!(job_id = %id, workflow = %kind, team = %spec.team, "Job queued");

        let permit = match &self.permits {
            Some(permits) => Some(
                Arc::clone(permits)
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Other(e.to_string()))?,
            ),
            None => None,
        };

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env("OVERSEER_JOB_ID", &id)
            .env("OVERSEER_SESSION_ID", ctx.session_id.as_deref().unwrap_or_default())
            .env(
                "OVERSEER_MODEL_TIER",
                ctx.tier.map(|t| t.as_str()).unwrap_or_default(),
            )
            .env("OVERSEER_ARTIFACT_PATH", self.layout().artifact_path(&id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // Spawn under the record lock so a concurrent stop sees either a
        // queued job or a running one with a pid.
        let mut child = {
            let mut status = entry.lock()?;
            if status.state != JobState::Queued {
                debug!(job_id = %id, state = %status.state, "Job stopped before launch");
                return Ok(status.handle());
            }
            match command.spawn() {
                Ok(child) => {
                    status.pid = child.id();
                    status.transition(JobState::Running)?;
                    self.recorder.commit(&status);
                    info!(job_id = %id, pid = ?status.pid, "Job running");
                    child
                }
                Err(e) => {
                    status.error = Some(e.to_string());
                    status.transition(JobState::Failed)?;
                    self.recorder.commit(&status);
                    entry.mark_finished();
                    error!(job_id = %id, program = %program.display(), "Spawn failed: {}", e);
                    return Err(Error::ProcessSpawn {
                        job_id: id,
                        reason: e.to_string(),
                    });
                }
            }
        };

        let sink = Arc::new(OutputSink::open(&self.layout().log_path(&id), Arc::clone(&entry.logs)).await);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(process::pump(stdout, Arc::clone(&sink), id.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(process::pump(stderr, sink, id.clone(), "stderr"));
        }

        let handle = entry.snapshot()?.handle();
        tokio::spawn(wait_for_exit(child, entry, pumps, self.recorder.clone(), permit));
        Ok(handle)
    }

    /// Stop a job. The first call for a live job returns true; calls for
    /// finished, unknown or already-stopping jobs return false.
    pub async fn stop(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.entry(id)? else {
            return Ok(false);
        };

        let pid = {
            let mut status = entry.lock()?;
            if status.state.is_terminal() || entry.stop_requested.swap(true, Ordering::SeqCst) {
                return Ok(false);
            }
            if status.state == JobState::Queued {
                status.error = Some("stopped before launch".to_string());
                status.transition(JobState::Killed)?;
                self.recorder.commit(&status);
                entry.mark_finished();
                info!(job_id = %id, "Queued job cancelled");
                return Ok(true);
            }
            status.pid
        };

        info!(job_id = %id, pid = ?pid, "Stopping job");
        let Some(pid) = pid else {
            return Ok(true);
        };
        let grace = Duration::from_secs(self.config.stop_timeout_secs);

        if entry.detached {
            self.stop_detached(&entry, pid, grace).await?;
        } else {
            if let Err(e) = process::signal_group(pid, libc::SIGTERM) {
                warn!(job_id = %id, "SIGTERM failed: {}", e);
            }
            let mut finished = entry.finished.subscribe();
            if tokio::time::timeout(grace, finished.wait_for(|done| *done)).await.is_err() {
                warn!(job_id = %id, "Worker ignored SIGTERM, sending SIGKILL");
                if let Err(e) = process::signal_group(pid, libc::SIGKILL) {
                    warn!(job_id = %id, "SIGKILL failed: {}", e);
                }
                let _ = tokio::time::timeout(KILL_WAIT, finished.wait_for(|done| *done)).await;
            }
        }
        Ok(true)
    }

    async fn stop_detached(&self, entry: &JobEntry, pid: u32, grace: Duration) -> Result<()> {
        if let Err(e) = process::terminate(pid, libc::SIGTERM) {
            warn!(pid, "SIGTERM failed: {}", e);
        }
        if !wait_until_gone(pid, grace).await {
            warn!(pid, "Adopted worker ignored SIGTERM, sending SIGKILL");
            if let Err(e) = process::terminate(pid, libc::SIGKILL) {
                warn!(pid, "SIGKILL failed: {}", e);
            }
            wait_until_gone(pid, KILL_WAIT).await;
        }
        self.finish_detached(entry)?;
        Ok(())
    }

    /// Settle an adopted job whose process is gone. Returns true if it changed.
    fn finish_detached(&self, entry: &JobEntry) -> Result<bool> {
        let mut status = entry.lock()?;
        if status.state.is_terminal() {
            return Ok(false);
        }
        if entry.stop_requested.load(Ordering::SeqCst) {
            status.transition(JobState::Killed)?;
        } else {
            status.error = Some("worker exited while detached from the supervisor".to_string());
            status.transition(JobState::Failed)?;
        }
        self.recorder.commit(&status);
        entry.mark_finished();
        info!(job_id = %status.id, state = %status.state, "Adopted job finished");
        Ok(true)
    }

    fn check_detached(&self, entry: &JobEntry) -> Result<bool> {
        let pid = {
            let status = entry.lock()?;
            if status.state.is_terminal() {
                return Ok(false);
            }
            status.pid
        };
        match pid {
            Some(pid) if process::is_alive(pid) => Ok(false),
            _ => self.finish_detached(entry),
        }
    }

    pub async fn status(&self, id: &str) -> Result<JobStatus> {
        match self.entry(id)? {
            Some(entry) => {
                if entry.detached {
                    self.check_detached(&entry)?;
                }
                entry.snapshot()
            }
            None => self
                .layout()
                .read_manifest(id)?
                .ok_or_else(|| Error::not_found("job", id)),
        }
    }

    /// Newest `max_lines` lines of output. None when the job produced none.
    pub async fn logs(&self, id: &str, max_lines: usize) -> Result<Option<String>> {
        let known = match self.entry(id)? {
            Some(entry) => {
                let ring = entry
                    .logs
                    .lock()
                    .map_err(|_| Error::Other("log ring lock poisoned".to_string()))?;
                // once the ring has dropped lines, longer tails come from the file
                if ring.covers(max_lines) {
                    if let Some(tail) = ring.tail(max_lines) {
                        return Ok(Some(tail));
                    }
                }
                true
            }
            None => self.layout().manifest_path(id).exists(),
        };
        if !known {
            return Err(Error::not_found("job", id));
        }
        self.layout().read_log_tail(id, max_lines)
    }

    /// Every known job, oldest first
    pub async fn list_all(&self) -> Result<Vec<JobHandle>> {
        let entries: Vec<Arc<JobEntry>> = self.read_jobs()?.values().cloned().collect();
        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.detached {
                self.check_detached(&entry)?;
            }
            handles.push(entry.snapshot()?.handle());
        }
        handles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(handles)
    }

    /// Re-check adopted jobs and settle those whose process is gone.
    pub async fn reconcile_detached(&self) -> Result<Vec<String>> {
        let entries: Vec<Arc<JobEntry>> = self
            .read_jobs()?
            .values()
            .filter(|e| e.detached)
            .cloned()
            .collect();
        let mut settled = Vec::new();
        for entry in entries {
            if self.check_detached(&entry)? {
                settled.push(entry.snapshot()?.id);
            }
        }
        Ok(settled)
    }

    /// Wait for a job to reach a terminal state.
    pub async fn wait(&self, id: &str) -> Result<JobStatus> {
        let entry = self.entry(id)?.ok_or_else(|| Error::not_found("job", id))?;
        if entry.detached {
            while !self.check_detached(&entry)? && !entry.snapshot()?.state.is_terminal() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        } else {
            let mut finished = entry.finished.subscribe();
            finished
                .wait_for(|done| *done)
                .await
                .map_err(|e| Error::Other(e.to_string()))?;
        }
        entry.snapshot()
    }
}

async fn wait_until_gone(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while process::is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    true
}

fn describe_exit(job_id: &str, exit: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match exit.signal() {
        Some(signal) => format!("worker for job {} terminated by signal {}", job_id, signal),
        None => Error::ProcessCrash {
            job_id: job_id.to_string(),
            exit_code: exit.code(),
        }
        .to_string(),
    }
}

/// Owns the child until it exits and applies the single terminal transition.
async fn wait_for_exit(
    mut child: Child,
    entry: Arc<JobEntry>,
    pumps: Vec<JoinHandle<()>>,
    recorder: Recorder,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let exit = child.wait().await;
    for pump in pumps {
        if tokio::time::timeout(PUMP_DRAIN, pump).await.is_err() {
            debug!("Output pipe still open after worker exit");
        }
    }

    let Ok(mut status) = entry.lock() else {
        error!("Job record poisoned, terminal state not recorded");
        return;
    };
    let stopped = entry.stop_requested.load(Ordering::SeqCst);
    let next = match &exit {
        Ok(code) => {
            status.exit_code = code.code();
            if stopped {
                JobState::Killed
            } else if code.success() {
                JobState::Succeeded
            } else {
                status.error = Some(describe_exit(&status.id, code));
                JobState::Failed
            }
        }
        Err(e) => {
            status.error = Some(format!("wait failed: {}", e));
            if stopped { JobState::Killed } else { JobState::Failed }
        }
    };

    match status.transition(next) {
        Ok(()) => {
            recorder.commit(&status);
            info!(job_id = %status.id, state = %status.state, exit_code = ?status.exit_code, "Job finished");
        }
        Err(e) => warn!(job_id = %status.id, "Terminal transition rejected: {}", e),
    }
    drop(status);
    entry.mark_finished();
}
