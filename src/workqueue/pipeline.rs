use super::*;

#[derive(Default)]
struct PipelineState {
    queue: VecDeque<Job>,
    /// Names of queued and running jobs with their multiplicity.
    names: HashMap<String, usize>,
    paused: bool,
    closed: bool,
    stopped: bool,
    /// Pending worker retirement tokens.
    retire: usize,
}

impl PipelineState {
    fn is_full(&self, max_size: Option<usize>) -> bool {
        max_size.is_some_and(|max| self.queue.len() >= max)
    }

    fn forget_name(&mut self, name: &str) {
        if let Some(count) = self.names.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                self.names.remove(name);
            }
        }
    }
}

/// Thread-safe job queue feeding the workers of a [`MainLoop`].
///
/// Jobs are served first in, first out; a forced enqueue places the job at
/// the head instead. With a size bound, enqueueing blocks while the queue
/// is full. A job name stays registered from enqueue until
/// [`task_done`](Pipeline::task_done), across retries.
pub struct Pipeline {
    state: Mutex<PipelineState>,
    max_size: Option<usize>,
    item_added: Condvar,
    item_removed: Condvar,
}

impl Pipeline {
    /// Creates a pipeline; `None` means unbounded.
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            state: Mutex::new(PipelineState::default()),
            max_size,
            item_added: Condvar::new(),
            item_removed: Condvar::new(),
        }
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Appends `job`, or inserts it at the head when `force` is set.
    ///
    /// Blocks while the pipeline is full. Fails with
    /// [`FleetError::PipelineClosed`] once the pipeline was closed.
    pub fn enqueue(&self, job: Job, force: bool) -> Result<JobId, FleetError> {
        self.push(job, force, false, true)
    }

    /// Like [`enqueue`](Pipeline::enqueue), but fails with
    /// [`FleetError::DuplicateJob`] if a job of the same name is queued or
    /// running.
    pub fn enqueue_unique(&self, job: Job, force: bool) -> Result<JobId, FleetError> {
        self.push(job, force, true, true)
    }

    /// Like [`enqueue_unique`](Pipeline::enqueue_unique), but a duplicate
    /// is silently dropped.
    pub fn enqueue_or_ignore(&self, job: Job, force: bool) -> Result<Option<JobId>, FleetError> {
        self.push_or_ignore(job, force, true)
    }

    pub(super) fn push_or_ignore(
        &self,
        job: Job,
        force: bool,
        bounded: bool,
    ) -> Result<Option<JobId>, FleetError> {
        match self.push(job, force, true, bounded) {
            Ok(id) => Ok(Some(id)),
            Err(FleetError::DuplicateJob(name)) => {
                trace!("Ignoring duplicate job '{}'", name);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Inserts a job. Only a `bounded` push waits for room.
    pub(super) fn push(
        &self,
        mut job: Job,
        force: bool,
        unique: bool,
        bounded: bool,
    ) -> Result<JobId, FleetError> {
        let mut state = lock(&self.state);
        loop {
            if state.closed || state.stopped {
                return Err(FleetError::PipelineClosed);
            }
            if unique && state.names.contains_key(job.name()) {
                return Err(FleetError::DuplicateJob(job.name().to_string()));
            }
            if !bounded || !state.is_full(self.max_size) {
                break;
            }
            state = self
                .item_removed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let id = job.id();
        job.set_status(JobStatus::Waiting);
        *state.names.entry(job.name().to_string()).or_insert(0) += 1;
        if force {
            state.queue.push_front(job);
        } else {
            state.queue.push_back(job);
        }
        self.item_added.notify_one();
        Ok(id)
    }

    /// Registers the name of a job that runs outside the queue, so that
    /// [`task_done`](Pipeline::task_done) and duplicate checks see it.
    pub(super) fn register(&self, name: &str) -> Result<(), FleetError> {
        let mut state = lock(&self.state);
        if state.closed || state.stopped {
            return Err(FleetError::PipelineClosed);
        }
        *state.names.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Moves the queued job called `name` to the head.
    ///
    /// Returns false if no job of that name is queued or running.
    pub fn prioritize(&self, name: &str) -> bool {
        let mut state = lock(&self.state);
        if !state.names.contains_key(name) {
            return false;
        }
        if let Some(pos) = state.queue.iter().position(|job| job.name() == name)
            && let Some(job) = state.queue.remove(pos)
        {
            state.queue.push_front(job);
        }
        true
    }

    /// Puts a failed job back at the tail for another attempt.
    ///
    /// Retries ignore the size bound and are accepted while the pipeline
    /// drains after [`close`](Pipeline::close). After
    /// [`stop`](Pipeline::stop) the job is handed back.
    pub fn requeue(&self, mut job: Job) -> Result<(), Job> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Err(job);
        }
        job.set_status(JobStatus::Waiting);
        state.queue.push_back(job);
        self.item_added.notify_one();
        Ok(())
    }

    /// Blocks until a job is available and removes it from the head.
    ///
    /// Returns `None` when the calling worker should exit: the pipeline
    /// was stopped, a retirement token was pending, or the pipeline was
    /// closed and has drained.
    pub fn dequeue(&self) -> Option<Job> {
        let mut state = lock(&self.state);
        loop {
            if state.stopped {
                return None;
            }
            if state.retire > 0 {
                state.retire -= 1;
                return None;
            }
            if !state.paused
                && let Some(mut job) = state.queue.pop_front()
            {
                job.set_status(JobStatus::Running);
                self.item_removed.notify_one();
                return Some(job);
            }
            if state.closed && state.queue.is_empty() {
                return None;
            }
            state = self
                .item_added
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Releases the name of a job that will not run again.
    pub fn task_done(&self, name: &str) {
        lock(&self.state).forget_name(name);
    }

    /// True if a job of this name is queued or running.
    pub fn contains(&self, name: &str) -> bool {
        lock(&self.state).names.contains_key(name)
    }

    /// Stops handing out jobs until [`unpause`](Pipeline::unpause).
    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn unpause(&self) {
        lock(&self.state).paused = false;
        self.item_added.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    /// Rejects new jobs; workers exit once the queue has drained.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.item_added.notify_all();
        self.item_removed.notify_all();
    }

    /// Rejects new jobs and makes every worker exit at its next dequeue.
    ///
    /// Returns the jobs that were still queued.
    pub fn stop(&self) -> Vec<Job> {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.closed = true;
        let drained: Vec<Job> = state.queue.drain(..).collect();
        for job in &drained {
            state.forget_name(job.name());
        }
        self.item_added.notify_all();
        self.item_removed.notify_all();
        drained
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Accepts jobs again after [`close`](Pipeline::close) or
    /// [`stop`](Pipeline::stop). Pending retirement tokens are dropped.
    pub fn reopen(&self) {
        let mut state = lock(&self.state);
        state.closed = false;
        state.stopped = false;
        state.retire = 0;
    }

    /// Makes `n` idle workers exit.
    pub fn retire(&self, n: usize) {
        lock(&self.state).retire += n;
        self.item_added.notify_all();
    }

    /// Number of queued jobs, excluding running ones.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every queued job.
    pub fn clear(&self) -> Vec<Job> {
        let mut state = lock(&self.state);
        let drained: Vec<Job> = state.queue.drain(..).collect();
        for job in &drained {
            state.forget_name(job.name());
        }
        self.item_removed.notify_all();
        drained
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Pipeline")
            .field("queued", &state.queue.len())
            .field("max_size", &self.max_size)
            .field("paused", &state.paused)
            .field("closed", &state.closed)
            .field("stopped", &state.stopped)
            .finish()
    }
}
