//! Per-user fair scheduling and the single-flight worker loop.
//!
//! One worker thread executes jobs one at a time. Each user has a FIFO
//! queue; a round-robin rotation over users with pending work decides who
//! runs next. All state transitions are serialised under a single mutex;
//! events are pushed to a bounded inbox that the notification pump drains
//! on the async side.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::errors::AppError;
use super::job::{Job, JobEvent, JobKind, JobStatus};
use crate::config::Config;

/// Best-effort handle that delivers a cancel signal to the upstream
/// session of the currently running job.
pub type CancelHandle = Arc<dyn Fn() -> bool + Send + Sync>;

/// A job event leaving the scheduler, paired with the snapshot taken at
/// emit time so the pump can persist it without re-locking.
#[derive(Debug)]
pub struct Notification {
    /// Owner the event should be fanned out to.
    pub owner_id: String,
    /// The client-visible event.
    pub event: JobEvent,
    /// Job state at the moment the event was emitted.
    pub snapshot: Job,
}

/// Capabilities handed to a processor while its job runs.
pub struct ProcessorContext<'a> {
    /// Handle onto the async runtime for upstream I/O.
    pub runtime: tokio::runtime::Handle,
    /// Report progress in percent; clamped to 0..=100.
    pub progress: &'a (dyn Fn(f64) + Send + Sync),
    /// Register the upstream interrupt as the active cancel handle.
    pub set_cancel_handle: &'a (dyn Fn(CancelHandle) + Send + Sync),
    /// Whether a cancel has been requested for this job.
    pub is_cancel_requested: &'a (dyn Fn() -> bool + Send + Sync),
}

impl std::fmt::Debug for ProcessorContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorContext").finish_non_exhaustive()
    }
}

/// Executes one job on the worker thread.
///
/// A successful return yields the result map stored on the job; an error
/// return is classified by the scheduler into `error` or `cancelled`.
pub trait Processor: Send + Sync {
    /// Run the job to completion.
    fn process(&self, job: &Job, ctx: &ProcessorContext<'_>) -> anyhow::Result<Map<String, Value>>;
}

/// Tuning knobs for the scheduler, typically derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Queued jobs allowed per user before enqueue rejects.
    pub max_per_user_queue: usize,
    /// Concurrently running jobs allowed per user.
    pub max_per_user_concurrent: usize,
    /// Watchdog timeout for a running job; `None` disables it.
    pub job_timeout: Option<Duration>,
    /// Log progress only at multiples of this percentage (0 disables).
    pub progress_log_step: u32,
    /// Minimum interval between progress log lines.
    pub progress_log_min_interval: Duration,
    /// Emit progress lines at debug instead of info.
    pub progress_log_debug: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_per_user_queue: 5,
            max_per_user_concurrent: 1,
            job_timeout: Some(Duration::from_secs(180)),
            progress_log_step: 10,
            progress_log_min_interval: Duration::from_millis(500),
            progress_log_debug: false,
        }
    }
}

impl SchedulerSettings {
    /// Derive settings from the application configuration.
    #[must_use]
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_per_user_queue: cfg.max_per_user_queue,
            max_per_user_concurrent: cfg.max_per_user_concurrent,
            job_timeout: cfg.job_timeout(),
            progress_log_step: cfg.progress_log_step,
            progress_log_min_interval: Duration::from_millis(cfg.progress_log_min_ms),
            progress_log_debug: cfg.progress_log_level.eq_ignore_ascii_case("debug"),
        }
    }
}

/// Rolling duration averages over recently completed jobs.
#[derive(Debug, Clone, Serialize)]
pub struct RecentAverages {
    /// Mean duration in seconds across the window, `None` when empty.
    pub overall_avg_sec: Option<f64>,
    /// Mean duration per workflow id.
    pub per_workflow_avg_sec: HashMap<String, f64>,
    /// Number of completed jobs in the window.
    pub count: usize,
}

struct State {
    jobs: HashMap<String, Job>,
    user_queues: HashMap<String, VecDeque<String>>,
    users_rr: VecDeque<String>,
    running_by_user: HashMap<String, usize>,
    active_job_id: Option<String>,
    active_cancel: Option<CancelHandle>,
    cancel_requests: HashSet<String>,
}

/// The job manager: registry, per-user queues, and the worker loop.
pub struct Scheduler {
    state: Mutex<State>,
    processors: Mutex<HashMap<JobKind, Arc<dyn Processor>>>,
    notify_tx: mpsc::Sender<Notification>,
    settings: SchedulerSettings,
    stop: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

const IDLE_POLL: Duration = Duration::from_millis(50);

impl Scheduler {
    /// Create a scheduler that reports events into `notify_tx`.
    #[must_use]
    pub fn new(settings: SchedulerSettings, notify_tx: mpsc::Sender<Notification>) -> Self {
        Self {
            state: Mutex::new(State {
                jobs: HashMap::new(),
                user_queues: HashMap::new(),
                users_rr: VecDeque::new(),
                running_by_user: HashMap::new(),
                active_job_id: None,
                active_cancel: None,
                cancel_requests: HashSet::new(),
            }),
            processors: Mutex::new(HashMap::new()),
            notify_tx,
            settings,
            stop: AtomicBool::new(false),
        }
    }

    /// Register the processor for a job kind.
    pub fn register_processor(&self, kind: JobKind, processor: Arc<dyn Processor>) {
        self.processors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(kind, processor);
    }

    /// Spawn the worker thread. `runtime` is the handle processors use to
    /// drive upstream I/O from the worker thread.
    pub fn start(
        self: &Arc<Self>,
        runtime: tokio::runtime::Handle,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        std::thread::Builder::new()
            .name("job-worker".into())
            .spawn(move || scheduler.run_loop(&runtime))
    }

    /// Ask the worker loop to exit after the current job.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Enqueue a job for `owner_id`.
    ///
    /// Rejects with [`AppError::QueueFull`] when the owner's pending queue
    /// is at capacity. Emits the `queued` event before returning.
    pub fn enqueue(
        &self,
        owner_id: &str,
        kind: JobKind,
        payload: Value,
    ) -> Result<Job, AppError> {
        let job = Job::new(owner_id.to_owned(), kind, payload);
        let (snapshot, position) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let queue = state.user_queues.entry(owner_id.to_owned()).or_default();
            if queue.len() >= self.settings.max_per_user_queue {
                return Err(AppError::QueueFull);
            }
            queue.push_back(job.id.clone());
            let position = queue.len() - 1;
            if !state.users_rr.iter().any(|u| u == owner_id) {
                state.users_rr.push_back(owner_id.to_owned());
            }
            state.jobs.insert(job.id.clone(), job.clone());
            (job.clone(), position)
        };
        self.emit(
            JobEvent::Queued {
                job_id: snapshot.id.clone(),
                position,
            },
            snapshot,
        );
        Ok(job)
    }

    /// Snapshot of a job by id.
    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock_state().jobs.get(job_id).cloned()
    }

    /// Zero-based queue position; 0 once the job left the queue. `None`
    /// for unknown jobs.
    #[must_use]
    pub fn position(&self, job_id: &str) -> Option<usize> {
        let state = self.lock_state();
        let job = state.jobs.get(job_id)?;
        let position = state
            .user_queues
            .get(&job.owner_id)
            .and_then(|q| q.iter().position(|id| id == job_id))
            .unwrap_or(0);
        Some(position)
    }

    /// Most recent jobs, newest first.
    #[must_use]
    pub fn list_jobs(&self, limit: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock_state().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// The owner's currently running job, if any.
    #[must_use]
    pub fn active_for_owner(&self, owner_id: &str) -> Option<Job> {
        let state = self.lock_state();
        let id = state.active_job_id.as_ref()?;
        let job = state.jobs.get(id)?;
        (job.owner_id == owner_id && job.status == JobStatus::Running).then(|| job.clone())
    }

    /// Whether a cancel has been requested for a running job.
    #[must_use]
    pub fn is_cancel_requested(&self, job_id: &str) -> bool {
        self.lock_state().cancel_requests.contains(job_id)
    }

    /// Register (or clear) the cancel handle for the running job.
    pub fn set_active_cancel_handle(&self, handle: Option<CancelHandle>) {
        self.lock_state().active_cancel = handle;
    }

    /// Cancel a job.
    ///
    /// Queued jobs are removed and terminally cancelled right here; running
    /// jobs get a cancel request plus a best-effort invoke of the
    /// registered handle, and the worker classifies the terminal state.
    /// Returns false for unknown or already-terminal jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        enum Action {
            Cancelled(Job),
            Requested(Option<CancelHandle>),
            Ignored,
        }
        let action = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(job) = state.jobs.get(job_id) else {
                return false;
            };
            let (status, owner) = (job.status, job.owner_id.clone());
            match status {
                JobStatus::Queued => {
                    if let Some(queue) = state.user_queues.get_mut(&owner) {
                        queue.retain(|id| id != job_id);
                    }
                    let snapshot = state.jobs.get_mut(job_id).map(|j| {
                        j.status = JobStatus::Cancelled;
                        j.ended_at = Some(Utc::now());
                        j.clone()
                    });
                    snapshot.map_or(Action::Ignored, Action::Cancelled)
                }
                JobStatus::Running => {
                    state.cancel_requests.insert(job_id.to_owned());
                    Action::Requested(state.active_cancel.clone())
                }
                _ => Action::Ignored,
            }
        };
        match action {
            Action::Cancelled(snapshot) => {
                self.emit(
                    JobEvent::Cancelled {
                        job_id: job_id.to_owned(),
                        error: None,
                    },
                    snapshot,
                );
                true
            }
            Action::Requested(handle) => {
                if let Some(handle) = handle {
                    let _ = handle();
                }
                true
            }
            Action::Ignored => false,
        }
    }

    /// Mean durations over the most recent `limit` completed jobs.
    #[must_use]
    pub fn recent_averages(&self, limit: usize) -> RecentAverages {
        let mut completed: Vec<Job> = self
            .lock_state()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Complete && j.duration_secs().is_some())
            .cloned()
            .collect();
        completed.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        completed.truncate(limit);

        let durations: Vec<f64> = completed.iter().filter_map(Job::duration_secs).collect();
        let overall = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        let mut per: HashMap<String, Vec<f64>> = HashMap::new();
        for job in &completed {
            if let (Some(wf), Some(d)) = (job.workflow_id(), job.duration_secs()) {
                per.entry(wf.to_owned()).or_default().push(d);
            }
        }
        let per_workflow_avg_sec = per
            .into_iter()
            .map(|(wf, vals)| {
                let avg = vals.iter().sum::<f64>() / vals.len() as f64;
                (wf, avg)
            })
            .collect();

        RecentAverages {
            overall_avg_sec: overall,
            per_workflow_avg_sec,
            count: durations.len(),
        }
    }

    /// Worker loop: dequeue fairly, execute, classify terminal states.
    /// Runs until [`Scheduler::shutdown`].
    pub fn run_loop(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        while !self.stop.load(Ordering::Relaxed) {
            let Some(job) = self.next_job() else {
                std::thread::sleep(IDLE_POLL);
                continue;
            };
            let processor = self
                .processors
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&job.kind)
                .cloned();
            let Some(processor) = processor else {
                self.mark_failed(&job.id, "No processor for job type");
                self.finish_job(&job);
                continue;
            };
            self.execute(&job, processor.as_ref(), runtime);
            self.finish_job(&job);
        }
    }

    fn execute(
        self: &Arc<Self>,
        job: &Job,
        processor: &dyn Processor,
        runtime: &tokio::runtime::Handle,
    ) {
        let snapshot = {
            let mut state = self.lock_state();
            state.active_job_id = Some(job.id.clone());
            state.active_cancel = None;
            let entry = state.jobs.get_mut(&job.id);
            entry.map(|j| {
                j.status = JobStatus::Running;
                j.started_at = Some(Utc::now());
                j.clone()
            })
        };
        let Some(snapshot) = snapshot else { return };
        tracing::info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            kind = %job.kind,
            "job started"
        );
        self.emit(
            JobEvent::Running {
                job_id: job.id.clone(),
                progress: 0.0,
            },
            snapshot.clone(),
        );

        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let watchdog = self
            .settings
            .job_timeout
            .map(|timeout| self.spawn_watchdog(&job.id, timeout, done_rx));

        let log_gate = Mutex::new(ProgressLogState::default());
        let progress = |p: f64| self.report_progress(&snapshot.id, p, &log_gate);
        let set_cancel_handle =
            |handle: CancelHandle| self.set_active_cancel_handle(Some(handle));
        let job_id = snapshot.id.clone();
        let is_cancel_requested = move || self.is_cancel_requested(&job_id);
        let ctx = ProcessorContext {
            runtime: runtime.clone(),
            progress: &progress,
            set_cancel_handle: &set_cancel_handle,
            is_cancel_requested: &is_cancel_requested,
        };

        let outcome = processor.process(&snapshot, &ctx);
        let _ = done_tx.send(());
        drop(watchdog);

        match outcome {
            Ok(result) => {
                let snapshot = {
                    let mut state = self.lock_state();
                    state.jobs.get_mut(&job.id).map(|j| {
                        if j.status != JobStatus::Cancelled {
                            j.status = JobStatus::Complete;
                            j.progress = 100.0;
                            j.ended_at = Some(Utc::now());
                            j.result = result;
                        }
                        j.clone()
                    })
                };
                if let Some(snapshot) = snapshot {
                    tracing::info!(job_id = %job.id, owner_id = %job.owner_id, "job complete");
                    self.emit(
                        JobEvent::Complete {
                            job_id: job.id.clone(),
                            result: snapshot.result.clone(),
                        },
                        snapshot,
                    );
                }
            }
            Err(err) => self.mark_failed(&job.id, &err.to_string()),
        }
    }

    /// Terminal bookkeeping shared by every execution path.
    fn finish_job(&self, job: &Job) {
        let mut state = self.lock_state();
        state.active_job_id = None;
        state.active_cancel = None;
        state.cancel_requests.remove(&job.id);
        if let Some(count) = state.running_by_user.get_mut(&job.owner_id) {
            *count = count.saturating_sub(1);
        }
        let status = state
            .jobs
            .get(&job.id)
            .map_or(JobStatus::Error, |j| j.status);
        drop(state);
        tracing::info!(job_id = %job.id, owner_id = %job.owner_id, status = %status, "job ended");
    }

    fn spawn_watchdog(
        self: &Arc<Self>,
        job_id: &str,
        timeout: Duration,
        done: std::sync::mpsc::Receiver<()>,
    ) -> std::thread::JoinHandle<()> {
        // The watchdog mirrors the cancel(running) path: set the request,
        // poke the handle, emit `cancelling`. The terminal state arrives
        // through the normal error classification once the session ends.
        let job_id = job_id.to_owned();
        let scheduler = Arc::clone(self);
        std::thread::spawn(move || {
            // Ok or Disconnected both mean the job finished in time.
            if !matches!(
                done.recv_timeout(timeout),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout)
            ) {
                return;
            }
            let (still_running, handle, snapshot) = {
                let mut state = scheduler.lock_state();
                let running = state.active_job_id.as_deref() == Some(job_id.as_str())
                    && state
                        .jobs
                        .get(&job_id)
                        .is_some_and(|j| j.status == JobStatus::Running);
                if running {
                    state.cancel_requests.insert(job_id.clone());
                }
                let snapshot = state.jobs.get(&job_id).cloned();
                (running, state.active_cancel.clone(), snapshot)
            };
            if !still_running {
                return;
            }
            tracing::warn!(job_id = %job_id, timeout_secs = timeout.as_secs_f64(), "job timed out, cancelling");
            if let Some(handle) = handle {
                let _ = handle();
            }
            if let Some(snapshot) = snapshot {
                scheduler.emit(JobEvent::Cancelling { job_id }, snapshot);
            }
        })
    }

    fn report_progress(&self, job_id: &str, value: f64, log_gate: &Mutex<ProgressLogState>) {
        let progress = value.clamp(0.0, 100.0);
        let snapshot = {
            let mut state = self.lock_state();
            state.jobs.get_mut(job_id).map(|j| {
                j.progress = progress;
                j.clone()
            })
        };
        let Some(snapshot) = snapshot else { return };
        let owner_id = snapshot.owner_id.clone();
        self.emit(
            JobEvent::Running {
                job_id: job_id.to_owned(),
                progress,
            },
            snapshot,
        );

        let mut gate = log_gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !gate.should_log(
            progress,
            self.settings.progress_log_step,
            self.settings.progress_log_min_interval,
        ) {
            return;
        }
        if self.settings.progress_log_debug {
            tracing::debug!(job_id = %job_id, owner_id = %owner_id, progress, "job progress");
        } else {
            tracing::info!(job_id = %job_id, owner_id = %owner_id, progress, "job progress");
        }
    }

    /// Classify a failed execution into `cancelled` or `error`.
    fn mark_failed(&self, job_id: &str, message: &str) {
        let (snapshot, cancelled, message) = {
            let mut state = self.lock_state();
            let cancelled = state.cancel_requests.contains(job_id);
            let message = if cancelled {
                "Generation was cancelled.".to_owned()
            } else {
                message.to_owned()
            };
            let snapshot = state.jobs.get_mut(job_id).map(|j| {
                j.status = if cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Error
                };
                j.error_message = Some(message.clone());
                j.ended_at = Some(Utc::now());
                j.clone()
            });
            (snapshot, cancelled, message)
        };
        let Some(snapshot) = snapshot else { return };
        tracing::info!(
            job_id = %job_id,
            owner_id = %snapshot.owner_id,
            status = %snapshot.status,
            error = %message,
            "job failed"
        );
        let event = if cancelled {
            JobEvent::Cancelled {
                job_id: job_id.to_owned(),
                error: Some(message),
            }
        } else {
            JobEvent::Error {
                job_id: job_id.to_owned(),
                error: message,
            }
        };
        self.emit(event, snapshot);
    }

    /// Rotate users until one is eligible (non-empty queue, below its
    /// concurrency cap); pop its head job. The user stays in the rotation
    /// so future jobs keep their fairness slot.
    fn next_job(&self) -> Option<Job> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        for _ in 0..state.users_rr.len() {
            let user = state.users_rr.front()?.clone();
            let running = state.running_by_user.get(&user).copied().unwrap_or(0);
            let has_work = state
                .user_queues
                .get(&user)
                .is_some_and(|q| !q.is_empty());
            if has_work && running < self.settings.max_per_user_concurrent {
                let job_id = state.user_queues.get_mut(&user)?.pop_front()?;
                *state.running_by_user.entry(user).or_insert(0) += 1;
                // Send the user to the back of the rotation (but keep them
                // in it) so interleaved enqueues dispatch interleaved.
                state.users_rr.rotate_left(1);
                return state.jobs.get(&job_id).cloned();
            }
            state.users_rr.rotate_left(1);
        }
        None
    }

    fn emit(&self, event: JobEvent, snapshot: Job) {
        let notification = Notification {
            owner_id: snapshot.owner_id.clone(),
            event,
            snapshot,
        };
        if let Err(err) = self.notify_tx.try_send(notification) {
            tracing::warn!(error = %err, "notification inbox full, event dropped");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FnProcessor<F>(F);

    impl<F> Processor for FnProcessor<F>
    where
        F: Fn(&Job, &ProcessorContext<'_>) -> anyhow::Result<Map<String, Value>> + Send + Sync,
    {
        fn process(
            &self,
            job: &Job,
            ctx: &ProcessorContext<'_>,
        ) -> anyhow::Result<Map<String, Value>> {
            (self.0)(job, ctx)
        }
    }

    fn test_settings() -> SchedulerSettings {
        SchedulerSettings {
            job_timeout: None,
            progress_log_min_interval: Duration::ZERO,
            ..SchedulerSettings::default()
        }
    }

    fn scheduler_with(
        settings: SchedulerSettings,
    ) -> (Arc<Scheduler>, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(1024);
        (Arc::new(Scheduler::new(settings, tx)), rx)
    }

    fn wait_terminal(scheduler: &Scheduler, job_ids: &[String]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let all_done = job_ids.iter().all(|id| {
                scheduler
                    .get(id)
                    .is_some_and(|j| j.status.is_terminal())
            });
            if all_done {
                return;
            }
            assert!(Instant::now() < deadline, "jobs did not finish in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn drain_events(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_queue_full_rejected_at_capacity() {
        let settings = SchedulerSettings {
            max_per_user_queue: 2,
            ..test_settings()
        };
        let (scheduler, _rx) = scheduler_with(settings);
        assert!(scheduler.enqueue("anon-a", JobKind::Generate, json!({})).is_ok());
        assert!(scheduler.enqueue("anon-a", JobKind::Generate, json!({})).is_ok());
        let err = scheduler
            .enqueue("anon-a", JobKind::Generate, json!({}))
            .expect_err("third enqueue rejected");
        assert!(matches!(err, AppError::QueueFull));
        // A different owner is unaffected.
        assert!(scheduler.enqueue("anon-b", JobKind::Generate, json!({})).is_ok());
    }

    #[test]
    fn test_round_robin_interleaves_owners() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let (scheduler, _rx) = scheduler_with(test_settings());

        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        scheduler.register_processor(
            JobKind::Generate,
            Arc::new(FnProcessor(move |job: &Job, _ctx: &ProcessorContext<'_>| {
                let tag = job.payload["tag"].as_str().unwrap_or_default().to_owned();
                seen.lock().expect("order lock").push(tag);
                std::thread::sleep(Duration::from_millis(5));
                Ok(Map::new())
            })),
        );

        let mut ids = Vec::new();
        for tag in ["A1", "B1", "A2", "B2", "A3", "B3"] {
            let owner = if tag.starts_with('A') { "anon-a" } else { "anon-b" };
            let job = scheduler
                .enqueue(owner, JobKind::Generate, json!({ "tag": tag }))
                .expect("enqueue");
            ids.push(job.id);
        }

        let worker = scheduler.start(rt.handle().clone()).expect("worker");
        wait_terminal(&scheduler, &ids);
        scheduler.shutdown();
        worker.join().expect("worker joins");

        let order = order.lock().expect("order lock").clone();
        assert_eq!(order, vec!["A1", "B1", "A2", "B2", "A3", "B3"]);
    }

    #[test]
    fn test_cancel_queued_job_never_starts() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let (scheduler, mut rx) = scheduler_with(test_settings());

        let started: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&started);
        scheduler.register_processor(
            JobKind::Generate,
            Arc::new(FnProcessor(move |job: &Job, _ctx: &ProcessorContext<'_>| {
                seen.lock().expect("lock").push(job.id.clone());
                std::thread::sleep(Duration::from_millis(50));
                Ok(Map::new())
            })),
        );

        let c1 = scheduler
            .enqueue("anon-c", JobKind::Generate, json!({}))
            .expect("enqueue c1");
        let c2 = scheduler
            .enqueue("anon-c", JobKind::Generate, json!({}))
            .expect("enqueue c2");

        assert!(scheduler.cancel(&c2.id));
        let worker = scheduler.start(rt.handle().clone()).expect("worker");
        wait_terminal(&scheduler, std::slice::from_ref(&c1.id));
        scheduler.shutdown();
        worker.join().expect("worker joins");

        assert_eq!(
            scheduler.get(&c2.id).expect("c2").status,
            JobStatus::Cancelled
        );
        assert_eq!(
            scheduler.get(&c1.id).expect("c1").status,
            JobStatus::Complete
        );
        assert_eq!(started.lock().expect("lock").as_slice(), &[c1.id.clone()]);

        // C2's event stream is exactly queued then cancelled.
        let events: Vec<String> = drain_events(&mut rx)
            .into_iter()
            .filter(|n| n.event.job_id() == c2.id)
            .map(|n| {
                serde_json::to_value(&n.event).expect("serialize")["status"]
                    .as_str()
                    .expect("status")
                    .to_owned()
            })
            .collect();
        assert_eq!(events, vec!["queued", "cancelled"]);
    }

    #[test]
    fn test_progress_clamped_and_stored() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let (scheduler, _rx) = scheduler_with(test_settings());
        scheduler.register_processor(
            JobKind::Generate,
            Arc::new(FnProcessor(|_job: &Job, ctx: &ProcessorContext<'_>| {
                (ctx.progress)(150.0);
                (ctx.progress)(-3.0);
                Ok(Map::new())
            })),
        );
        let job = scheduler
            .enqueue("anon-p", JobKind::Generate, json!({}))
            .expect("enqueue");
        let worker = scheduler.start(rt.handle().clone()).expect("worker");
        wait_terminal(&scheduler, std::slice::from_ref(&job.id));
        scheduler.shutdown();
        worker.join().expect("worker joins");
        // Complete forces 100 regardless of the last reported value.
        let done = scheduler.get(&job.id).expect("job");
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.progress, 100.0);
    }

    #[test]
    fn test_timeout_cancels_running_job() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let settings = SchedulerSettings {
            job_timeout: Some(Duration::from_millis(100)),
            ..test_settings()
        };
        let (scheduler, mut rx) = scheduler_with(settings);
        scheduler.register_processor(
            JobKind::Generate,
            Arc::new(FnProcessor(|_job: &Job, ctx: &ProcessorContext<'_>| {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !(ctx.is_cancel_requested)() {
                    assert!(Instant::now() < deadline, "cancel never arrived");
                    std::thread::sleep(Duration::from_millis(10));
                }
                anyhow::bail!("stream aborted")
            })),
        );
        let job = scheduler
            .enqueue("anon-t", JobKind::Generate, json!({}))
            .expect("enqueue");
        let worker = scheduler.start(rt.handle().clone()).expect("worker");
        wait_terminal(&scheduler, std::slice::from_ref(&job.id));
        scheduler.shutdown();
        worker.join().expect("worker joins");

        let done = scheduler.get(&job.id).expect("job");
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.error_message.as_deref(), Some("Generation was cancelled."));

        let statuses: Vec<String> = drain_events(&mut rx)
            .into_iter()
            .map(|n| {
                serde_json::to_value(&n.event).expect("serialize")["status"]
                    .as_str()
                    .expect("status")
                    .to_owned()
            })
            .collect();
        assert!(statuses.contains(&"cancelling".to_owned()));
        assert_eq!(statuses.last().map(String::as_str), Some("cancelled"));
    }

    #[test]
    fn test_recent_averages_per_workflow() {
        let (scheduler, _rx) = scheduler_with(test_settings());
        {
            let mut guard = scheduler.lock_state();
            for (wf, secs) in [("wf-a", 2.0), ("wf-a", 4.0), ("wf-b", 6.0)] {
                let mut job = Job::new(
                    "anon-m".into(),
                    JobKind::Generate,
                    json!({ "workflow_id": wf }),
                );
                let start = Utc::now();
                job.status = JobStatus::Complete;
                job.started_at = Some(start);
                job.ended_at = Some(start + chrono::Duration::milliseconds((secs * 1000.0) as i64));
                guard.jobs.insert(job.id.clone(), job);
            }
        }
        let avg = scheduler.recent_averages(10);
        assert_eq!(avg.count, 3);
        assert!((avg.overall_avg_sec.expect("overall") - 4.0).abs() < 0.01);
        assert!((avg.per_workflow_avg_sec["wf-a"] - 3.0).abs() < 0.01);
        assert!((avg.per_workflow_avg_sec["wf-b"] - 6.0).abs() < 0.01);
    }

    #[test]
    fn test_position_tracks_queue_index() {
        let (scheduler, _rx) = scheduler_with(test_settings());
        let first = scheduler
            .enqueue("anon-q", JobKind::Generate, json!({}))
            .expect("enqueue");
        let second = scheduler
            .enqueue("anon-q", JobKind::Generate, json!({}))
            .expect("enqueue");
        assert_eq!(scheduler.position(&first.id), Some(0));
        assert_eq!(scheduler.position(&second.id), Some(1));
        assert_eq!(scheduler.position("missing"), None);
    }
}

/// Step/interval gating state for progress log lines.
#[derive(Debug, Default)]
struct ProgressLogState {
    last_logged_pct: Option<i64>,
    last_logged_at: Option<Instant>,
}

impl ProgressLogState {
    fn should_log(&mut self, progress: f64, step: u32, min_interval: Duration) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let rounded = progress.round() as i64;
        if step > 0 {
            if rounded % i64::from(step.max(1)) != 0 && rounded != 100 {
                return false;
            }
            if self.last_logged_pct == Some(rounded) {
                return false;
            }
        }
        if let Some(last) = self.last_logged_at {
            if !min_interval.is_zero() && last.elapsed() < min_interval {
                return false;
            }
        }
        self.last_logged_pct = Some(rounded);
        self.last_logged_at = Some(Instant::now());
        true
    }
}

