use super::*;

use std::panic::{self, AssertUnwindSafe};

use super::job::panic_message;
use crate::config::QueueConfig;

/// Callback receiving the lifecycle events of every job.
pub type JobObserver = Arc<dyn Fn(JobId, &JobEvent) + Send + Sync>;

/// Snapshot of the loop counters.
///
/// `completed` counts successful jobs only; `pending` counts jobs waiting
/// in the pipeline, including those waiting for a retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Progress {
    pub enqueued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl Progress {
    /// Jobs that will not run again.
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_done(&self) -> bool {
        self.finished() >= self.enqueued
    }
}

/// A job that failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FailureReport {
    pub job_id: JobId,
    pub name: String,
    pub attempts: usize,
    pub error: String,
}

#[derive(Default)]
struct Counters {
    enqueued: usize,
    running: usize,
    completed: usize,
    failed: usize,
    statuses: HashMap<JobId, JobStatus>,
    running_names: HashMap<JobId, String>,
    failures: Vec<FailureReport>,
}

impl Counters {
    fn unfinished(&self) -> usize {
        self.enqueued.saturating_sub(self.completed + self.failed)
    }

    fn progress(&self) -> Progress {
        Progress {
            enqueued: self.enqueued,
            running: self.running,
            completed: self.completed,
            failed: self.failed,
            pending: self.unfinished().saturating_sub(self.running),
        }
    }
}

struct LoopShared {
    pipeline: Pipeline,
    counters: Mutex<Counters>,
    changed: Condvar,
    observer: RwLock<Option<JobObserver>>,
}

impl LoopShared {
    fn notify(&self, id: JobId, event: &JobEvent) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(id, event)))
        {
            error!(
                "Observer failed on event of job {}: {}",
                id,
                panic_message(payload.as_ref())
            );
        }
    }

    fn job_started(&self, job: &Job) {
        info!(
            "Job '{}' started (attempt {}/{})",
            job.name(),
            job.attempt(),
            job.times()
        );
        {
            let mut counters = lock(&self.counters);
            counters.running += 1;
            counters.statuses.insert(job.id(), JobStatus::Running);
            counters
                .running_names
                .insert(job.id(), job.name().to_string());
        }
        self.notify(
            job.id(),
            &JobEvent::JobStarted {
                name: job.name().to_string(),
                attempt: job.attempt(),
            },
        );
    }

    fn job_succeeded(&self, mut job: Job) {
        job.set_status(JobStatus::Done);
        info!("Job '{}' succeeded", job.name());
        self.notify(job.id(), &JobEvent::JobSucceeded);
        self.pipeline.task_done(job.name());
        {
            let mut counters = lock(&self.counters);
            counters.running = counters.running.saturating_sub(1);
            counters.completed += 1;
            counters.statuses.insert(job.id(), JobStatus::Done);
            counters.running_names.remove(&job.id());
        }
        self.changed.notify_all();
    }

    fn job_errored(&self, mut job: Job, err: FleetError) {
        job.record_failure();
        let id = job.id();
        if err.is_transient() && job.has_attempts_left() {
            warn!(
                "Job '{}' failed on attempt {}/{}: {}",
                job.name(),
                job.failures(),
                job.times(),
                err
            );
            // Locked before the requeue: the retry must not start before
            // its waiting status is recorded.
            let mut counters = lock(&self.counters);
            match self.pipeline.requeue(job) {
                Ok(()) => {
                    counters.running = counters.running.saturating_sub(1);
                    counters.running_names.remove(&id);
                    counters.statuses.insert(id, JobStatus::Waiting);
                    drop(counters);
                    self.changed.notify_all();
                    return;
                }
                Err(returned) => job = returned,
            }
        }

        job.set_status(JobStatus::Failed);
        error!(
            "Job '{}' finally failed after {} attempt(s): {}",
            job.name(),
            job.failures(),
            err
        );
        let error = err.to_string();
        self.notify(
            id,
            &JobEvent::JobAborted {
                error: error.clone(),
            },
        );
        self.pipeline.task_done(job.name());
        {
            let mut counters = lock(&self.counters);
            counters.running = counters.running.saturating_sub(1);
            counters.running_names.remove(&id);
            counters.failed += 1;
            counters.statuses.insert(id, JobStatus::Failed);
            counters.failures.push(FailureReport {
                job_id: id,
                name: job.name().to_string(),
                attempts: job.failures(),
                error,
            });
        }
        self.changed.notify_all();
    }

    /// Marks jobs dropped by a forced shutdown as failed.
    fn cancel(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let error = FleetError::PipelineClosed.to_string();
        for job in &jobs {
            debug!("Dropping queued job '{}'", job.name());
            self.notify(
                job.id(),
                &JobEvent::JobAborted {
                    error: error.clone(),
                },
            );
        }
        {
            let mut counters = lock(&self.counters);
            for job in &jobs {
                counters.failed += 1;
                counters.statuses.insert(job.id(), JobStatus::Failed);
                counters.failures.push(FailureReport {
                    job_id: job.id(),
                    name: job.name().to_string(),
                    attempts: job.failures(),
                    error: error.clone(),
                });
            }
        }
        self.changed.notify_all();
    }
}

/// Cloneable handle for submitting jobs to a [`MainLoop`] and observing
/// its progress.
///
/// Every running job receives one through its [`JobContext`], so jobs can
/// schedule follow-on work. Submissions through such a handle ignore the
/// pipeline size bound and never block the worker that makes them.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
    in_job: bool,
}

impl LoopHandle {
    fn for_job(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            in_job: true,
        }
    }

    fn submit<F>(&self, job: Job, push: F) -> Result<Option<JobId>, FleetError>
    where
        F: FnOnce(&Pipeline, Job) -> Result<Option<JobId>, FleetError>,
    {
        let id = job.id();
        let name = job.name().to_string();
        {
            let mut counters = lock(&self.shared.counters);
            counters.enqueued += 1;
            counters.statuses.insert(id, JobStatus::Waiting);
        }
        let result = push(&self.shared.pipeline, job);
        if !matches!(result, Ok(Some(_))) {
            {
                let mut counters = lock(&self.shared.counters);
                counters.enqueued = counters.enqueued.saturating_sub(1);
                counters.statuses.remove(&id);
            }
            self.shared.changed.notify_all();
        } else {
            debug!("Enqueued job '{}' ({})", name, id);
        }
        result
    }

    /// Appends a job to the pipeline. Duplicate names are allowed.
    pub fn enqueue(&self, job: Job) -> Result<JobId, FleetError> {
        let bounded = !self.in_job;
        let id = self.submit(job, |pipeline, job| {
            pipeline.push(job, false, false, bounded).map(Some)
        })?;
        id.ok_or_else(|| FleetError::InternalServerError("job was not enqueued".to_string()))
    }

    /// Inserts a job at the head of the pipeline.
    pub fn priority_enqueue(&self, job: Job) -> Result<JobId, FleetError> {
        let bounded = !self.in_job;
        let id = self.submit(job, |pipeline, job| {
            pipeline.push(job, true, false, bounded).map(Some)
        })?;
        id.ok_or_else(|| FleetError::InternalServerError("job was not enqueued".to_string()))
    }

    /// Appends a job unless one of the same name is queued or running.
    pub fn enqueue_or_ignore(&self, job: Job) -> Result<Option<JobId>, FleetError> {
        let bounded = !self.in_job;
        self.submit(job, |pipeline, job| pipeline.push_or_ignore(job, false, bounded))
    }

    /// Inserts a job at the head. If one of the same name is already
    /// queued, that one is moved to the head instead and `None` returned.
    pub fn priority_enqueue_or_raise(&self, job: Job) -> Result<Option<JobId>, FleetError> {
        if self.shared.pipeline.prioritize(job.name()) {
            debug!("Raised queued job '{}'", job.name());
            return Ok(None);
        }
        let bounded = !self.in_job;
        self.submit(job, |pipeline, job| pipeline.push_or_ignore(job, true, bounded))
    }

    pub fn progress(&self) -> Progress {
        lock(&self.shared.counters).progress()
    }

    /// True when every enqueued job has finished.
    pub fn is_completed(&self) -> bool {
        lock(&self.shared.counters).unfinished() == 0
    }

    /// Current status of a job, `None` for unknown ids.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        lock(&self.shared.counters).statuses.get(&id).copied()
    }

    /// Blocks until the job has finished and returns its final status.
    ///
    /// Returns `None` immediately for unknown ids.
    pub fn wait_for(&self, id: JobId) -> Option<JobStatus> {
        let mut counters = lock(&self.shared.counters);
        loop {
            match counters.statuses.get(&id) {
                None => return None,
                Some(status) if status.is_finished() => return Some(*status),
                Some(_) => {
                    counters = self
                        .shared
                        .changed
                        .wait(counters)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Blocks until every enqueued job has finished.
    pub fn wait_until_done(&self) {
        let mut counters = lock(&self.shared.counters);
        while counters.unfinished() > 0 {
            counters = self
                .shared
                .changed
                .wait(counters)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Jobs that failed permanently, in the order they failed.
    pub fn failures(&self) -> Vec<FailureReport> {
        lock(&self.shared.counters).failures.clone()
    }

    /// Forgets the status of every finished job and all failure reports.
    ///
    /// The totals reported by [`progress`](LoopHandle::progress) are kept.
    /// Afterwards [`status`](LoopHandle::status) and
    /// [`wait_for`](LoopHandle::wait_for) treat the pruned ids as unknown.
    /// Returns the number of pruned jobs.
    pub fn clear_finished(&self) -> usize {
        let mut counters = lock(&self.shared.counters);
        let before = counters.statuses.len();
        counters.statuses.retain(|_, status| !status.is_finished());
        counters.failures.clear();
        let pruned = before - counters.statuses.len();
        trace!("Pruned {} finished job(s)", pruned);
        pruned
    }

    /// Ids and names of the jobs currently running.
    pub fn running_jobs(&self) -> Vec<(JobId, String)> {
        let counters = lock(&self.shared.counters);
        let mut running: Vec<_> = counters
            .running_names
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        running.sort_unstable();
        running
    }

    /// Number of jobs waiting in the pipeline.
    pub fn len(&self) -> usize {
        self.shared.pipeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.pipeline.is_empty()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("progress", &self.progress())
            .finish()
    }
}

fn run_attempt(handle: &LoopHandle, job: Job) {
    let shared = &handle.shared;
    shared.job_started(&job);
    match job.run(handle.for_job()) {
        Ok(()) => shared.job_succeeded(job),
        Err(err) => shared.job_errored(job, err),
    }
}

fn run_worker(handle: LoopHandle) {
    trace!("Worker ready");
    while let Some(job) = handle.shared.pipeline.dequeue() {
        run_attempt(&handle, job);
    }
    trace!("Worker exiting");
}

struct Workers {
    handles: Vec<JoinHandle<()>>,
    max_threads: usize,
    running: bool,
}

/// A pool of worker threads consuming a [`Pipeline`].
///
/// Workers are started on construction. Dropping the loop stops it
/// without waiting for queued jobs.
pub struct MainLoop {
    handle: LoopHandle,
    workers: Mutex<Workers>,
    next_worker: AtomicUsize,
}

impl MainLoop {
    /// Starts `max_threads` workers on an unbounded pipeline.
    pub fn new(max_threads: usize) -> Self {
        Self::with_pipeline(Pipeline::default(), max_threads)
    }

    /// Starts a loop from a validated configuration.
    pub fn from_config(config: &QueueConfig) -> Result<Self, FleetError> {
        config.validate()?;
        Ok(Self::with_pipeline(
            Pipeline::new(config.max_queue_size),
            config.max_threads,
        ))
    }

    /// Starts `max_threads` workers (at least one) on `pipeline`.
    pub fn with_pipeline(pipeline: Pipeline, max_threads: usize) -> Self {
        let main_loop = Self {
            handle: LoopHandle {
                shared: Arc::new(LoopShared {
                    pipeline,
                    counters: Mutex::new(Counters::default()),
                    changed: Condvar::new(),
                    observer: RwLock::new(None),
                }),
                in_job: false,
            },
            workers: Mutex::new(Workers {
                handles: Vec::new(),
                max_threads: max_threads.max(1),
                running: true,
            }),
            next_worker: AtomicUsize::new(1),
        };
        {
            let mut workers = lock(&main_loop.workers);
            let n = workers.max_threads;
            main_loop.spawn_workers(&mut workers, n);
        }
        main_loop
    }

    fn spawn_workers(&self, workers: &mut Workers, n: usize) {
        for _ in 0..n {
            let number = self.next_worker.fetch_add(1, Ordering::Relaxed);
            let handle = self.handle.clone();
            let spawned = thread::Builder::new()
                .name(format!("rnfleet-worker-{number}"))
                .spawn(move || run_worker(handle));
            match spawned {
                Ok(thread) => workers.handles.push(thread),
                Err(err) => error!("Failed to spawn worker {}: {}", number, err),
            }
        }
    }

    /// A handle for submitting jobs from elsewhere.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Installs or removes the job event observer.
    pub fn set_observer(&self, observer: Option<JobObserver>) {
        *self
            .handle
            .shared
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = observer;
    }

    pub fn enqueue(&self, job: Job) -> Result<JobId, FleetError> {
        self.handle.enqueue(job)
    }

    pub fn priority_enqueue(&self, job: Job) -> Result<JobId, FleetError> {
        self.handle.priority_enqueue(job)
    }

    pub fn enqueue_or_ignore(&self, job: Job) -> Result<Option<JobId>, FleetError> {
        self.handle.enqueue_or_ignore(job)
    }

    pub fn priority_enqueue_or_raise(&self, job: Job) -> Result<Option<JobId>, FleetError> {
        self.handle.priority_enqueue_or_raise(job)
    }

    /// Starts a job at once on a thread of its own, even when every
    /// worker is busy or the loop is paused.
    ///
    /// The extra thread is not counted against `max_threads` and exits
    /// after the first attempt; retries go through the pipeline like any
    /// other job.
    pub fn force_enqueue(&self, job: Job) -> Result<JobId, FleetError> {
        let mut workers = lock(&self.workers);
        if !workers.running {
            return Err(FleetError::PipelineClosed);
        }
        workers.handles.retain(|handle| !handle.is_finished());

        let mut admitted = None;
        let id = self.handle.submit(job, |pipeline, job| {
            pipeline.register(job.name())?;
            let id = job.id();
            admitted = Some(job);
            Ok(Some(id))
        })?;
        let id = id.ok_or_else(|| FleetError::InternalServerError("job was not admitted".to_string()))?;
        let slot = Arc::new(Mutex::new(admitted));

        let number = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let handle = self.handle.clone();
        let lane = slot.clone();
        let spawned = thread::Builder::new()
            .name(format!("rnfleet-forced-{number}"))
            .spawn(move || {
                let job = lock(&lane).take();
                if let Some(mut job) = job {
                    job.set_status(JobStatus::Running);
                    run_attempt(&handle, job);
                }
            });
        match spawned {
            Ok(thread) => {
                debug!("Forced job {} runs on its own thread", id);
                workers.handles.push(thread);
            }
            Err(err) => {
                error!("Failed to spawn thread for forced job {}: {}", id, err);
                let job = lock(&slot).take();
                if let Some(job) = job {
                    let shared = &self.handle.shared;
                    if let Err(job) = shared.pipeline.requeue(job) {
                        shared.pipeline.task_done(job.name());
                        shared.cancel(vec![job]);
                    }
                }
            }
        }
        Ok(id)
    }

    /// Changes the number of workers without dropping queued jobs.
    ///
    /// Growing spawns workers immediately; shrinking retires workers as
    /// they become idle. The count is clamped to at least one.
    pub fn set_max_threads(&self, max_threads: usize) {
        let max_threads = max_threads.max(1);
        let mut workers = lock(&self.workers);
        let current = workers.max_threads;
        workers.max_threads = max_threads;
        workers.handles.retain(|handle| !handle.is_finished());
        if !workers.running {
            return;
        }
        debug!("Resizing worker pool from {} to {}", current, max_threads);
        if max_threads > current {
            self.spawn_workers(&mut workers, max_threads - current);
        } else if max_threads < current {
            self.handle.shared.pipeline.retire(current - max_threads);
        }
    }

    pub fn max_threads(&self) -> usize {
        lock(&self.workers).max_threads
    }

    pub fn pause(&self) {
        self.handle.shared.pipeline.pause();
    }

    pub fn unpause(&self) {
        self.handle.shared.pipeline.unpause();
    }

    pub fn is_paused(&self) -> bool {
        self.handle.shared.pipeline.is_paused()
    }

    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.handle.is_completed()
    }

    pub fn progress(&self) -> Progress {
        self.handle.progress()
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.handle.status(id)
    }

    pub fn wait_for(&self, id: JobId) -> Option<JobStatus> {
        self.handle.wait_for(id)
    }

    pub fn wait_until_done(&self) {
        self.handle.wait_until_done()
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        self.handle.failures()
    }

    pub fn clear_finished(&self) -> usize {
        self.handle.clear_finished()
    }

    pub fn running_jobs(&self) -> Vec<(JobId, String)> {
        self.handle.running_jobs()
    }

    /// True while workers are attached.
    pub fn is_running(&self) -> bool {
        lock(&self.workers).running
    }

    /// Drops the queued jobs, reporting them as failed, and makes every
    /// worker exit after its current attempt. Does not wait for them; see
    /// [`shutdown`](MainLoop::shutdown).
    pub fn stop(&self) {
        let shared = &self.handle.shared;
        shared.cancel(shared.pipeline.stop());
    }

    /// Stops the workers.
    ///
    /// Without `force`, every queued job (and its retries) is processed
    /// first. With `force`, queued jobs are dropped and reported as failed;
    /// running jobs finish their current attempt but are not retried.
    pub fn shutdown(&self, force: bool) {
        let shared = &self.handle.shared;
        if !self.is_running() {
            return;
        }
        if force {
            self.stop();
        } else {
            shared.pipeline.unpause();
            self.handle.wait_until_done();
            shared.pipeline.close();
        }

        let handles = {
            let mut workers = lock(&self.workers);
            workers.running = false;
            std::mem::take(&mut workers.handles)
        };
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Main loop shut down");
    }

    /// Reopens the pipeline and starts fresh workers after a shutdown.
    pub fn restart(&self) {
        let mut workers = lock(&self.workers);
        if workers.running {
            return;
        }
        self.handle.shared.pipeline.reopen();
        workers.running = true;
        let n = workers.max_threads;
        self.spawn_workers(&mut workers, n);
        debug!("Main loop restarted with {} workers", n);
    }

    /// Stops immediately and forgets all counters. The loop accepts no
    /// further jobs.
    pub fn destroy(&self) {
        self.shutdown(true);
        *lock(&self.handle.shared.counters) = Counters::default();
        self.handle.shared.changed.notify_all();
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("max_threads", &self.max_threads())
            .field("progress", &self.progress())
            .field("pipeline", &self.handle.shared.pipeline)
            .finish()
    }
}
