use super::*;

use std::panic::{self, AssertUnwindSafe};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// The work a job performs. It is called once per attempt.
pub type JobAction = Arc<dyn Fn(&JobContext) -> Result<(), FleetError> + Send + Sync>;

/// Opaque payload handed to every attempt of a job.
pub type JobData = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// True once the job will never run again.
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// One schedulable unit of work.
pub struct Job {
    id: JobId,
    name: String,
    action: JobAction,
    times: usize,
    failures: usize,
    data: Option<JobData>,
    status: JobStatus,
}

impl Job {
    /// Creates a job that is attempted once.
    ///
    /// Unnamed jobs are called `job-<id>`.
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(&JobContext) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        Self::from_action(Arc::new(action))
    }

    /// Creates a job from an action shared with other jobs.
    pub fn from_action(action: JobAction) -> Self {
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            name: format!("job-{id}"),
            action,
            times: 1,
            failures: 0,
            data: None,
            status: JobStatus::Waiting,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Total number of attempts, at least one.
    pub fn with_times(mut self, times: usize) -> Self {
        self.times = times.max(1);
        self
    }

    pub fn with_data(mut self, data: JobData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn times(&self) -> usize {
        self.times
    }

    /// Number of failed attempts so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn data(&self) -> Option<&JobData> {
        self.data.as_ref()
    }

    /// 1-based number of the current (or next) attempt.
    pub fn attempt(&self) -> usize {
        self.failures + 1
    }

    /// True while another attempt fits in the budget.
    pub fn has_attempts_left(&self) -> bool {
        self.failures < self.times
    }

    pub(super) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    pub(super) fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Runs one attempt. A panicking action is reported as
    /// [`FleetError::JobFailure`].
    pub(super) fn run(&self, handle: LoopHandle) -> Result<(), FleetError> {
        let ctx = JobContext {
            id: self.id,
            name: self.name.clone(),
            attempt: self.attempt(),
            times: self.times,
            data: self.data.clone(),
            handle,
        };
        let action = self.action.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| action(&ctx))) {
            Ok(result) => result,
            Err(payload) => Err(FleetError::JobFailure(panic_message(payload.as_ref()))),
        }
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("times", &self.times)
            .field("failures", &self.failures)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// What a running attempt sees of its job.
pub struct JobContext {
    id: JobId,
    name: String,
    attempt: usize,
    times: usize,
    data: Option<JobData>,
    handle: LoopHandle,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn times(&self) -> usize {
        self.times
    }

    /// The job payload, if it holds a `T`.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }

    /// Handle of the loop running this job, for follow-on work.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("attempt", &self.attempt)
            .field("times", &self.times)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_name_defaults_to_id() {
        let a = Job::new(|_| Ok(()));
        let b = Job::new(|_| Ok(()));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), format!("job-{}", a.id()));
        assert_eq!(b.name(), format!("job-{}", b.id()));
    }

    #[test]
    fn attempt_budget_is_at_least_one() {
        let mut job = Job::new(|_| Ok(())).with_times(0);
        assert_eq!(job.times(), 1);
        assert!(job.has_attempts_left());
        job.record_failure();
        assert!(!job.has_attempts_left());
        assert_eq!(job.attempt(), 2);
    }

    #[test]
    fn panics_become_job_failures() {
        let main_loop = MainLoop::new(1);
        let job = Job::new(|_| panic!("boom"));
        let err = job.run(main_loop.handle()).expect_err("must fail");
        match err {
            FleetError::JobFailure(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn context_exposes_typed_data() {
        let main_loop = MainLoop::new(1);
        let job = Job::new(|ctx| {
            let value = ctx.data::<u32>().copied();
            if value == Some(7) && ctx.data::<String>().is_none() {
                Ok(())
            } else {
                Err(FleetError::JobFailure(format!("bad data {value:?}")))
            }
        })
        .with_data(Arc::new(7u32));
        assert!(job.run(main_loop.handle()).is_ok());
    }
}
