//! Fleet-level job queue.
//!
//! [`Queue`] ties the scheduler to the rest of the engine: every host job
//! acquires an account, opens a connection through the configured
//! [`Connector`], logs in, prepares the terminal and hands the resulting
//! [`Session`] to the caller's action.
//!
//! # Example
//!
//! ```rust,no_run
//! use rnfleet::account::Account;
//! use rnfleet::config::QueueConfig;
//! use rnfleet::connection::{VirtualConnector, VirtualDevice};
//! use rnfleet::queue::Queue;
//!
//! let connector = VirtualConnector::new(|host| {
//!     Ok(VirtualDevice::new(host.name()).with_strict(false))
//! });
//! let queue = Queue::new(connector, QueueConfig::default().with_max_threads(2))?;
//! queue.add_account(Account::new("admin", "secret"));
//! queue.run(["r1", "r2"], |_, _, session| {
//!     session.execute("show version")?;
//!     Ok(())
//! }, None)?;
//! queue.join();
//! # Ok::<(), rnfleet::error::FleetError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::account::{Account, AccountManager, AccountPool, PoolMatcher};
use crate::config::QueueConfig;
use crate::connection::Connector;
use crate::driver::DriverRegistry;
use crate::error::FleetError;
use crate::host::Host;
use crate::logger::{JobEvent, JobLogger, RecordLevel};
use crate::session::Session;
use crate::workqueue::{
    FailureReport, Job, JobContext, JobId, JobStatus, LoopHandle, MainLoop, Progress,
};

/// The work performed on one logged-in host.
pub type HostAction =
    Arc<dyn Fn(&JobContext, &Host, &mut Session) -> Result<(), FleetError> + Send + Sync>;

/// The jobs enqueued by one call.
#[derive(Debug, Clone)]
pub struct Task {
    handle: LoopHandle,
    ids: Vec<JobId>,
}

impl Task {
    pub fn job_ids(&self) -> &[JobId] {
        &self.ids
    }

    /// True once every job of the task has finished.
    pub fn is_completed(&self) -> bool {
        self.ids
            .iter()
            .all(|id| self.handle.status(*id).is_none_or(JobStatus::is_finished))
    }

    /// Blocks until every job of the task has finished.
    ///
    /// Returns true if all of them succeeded.
    pub fn wait(&self) -> bool {
        self.ids
            .iter()
            .map(|id| self.handle.wait_for(*id))
            .fold(true, |ok, status| ok && status == Some(JobStatus::Done))
    }
}

/// What a host job needs besides its host and action.
#[derive(Clone)]
struct HostJobEnv {
    accounts: Arc<AccountManager>,
    registry: Arc<DriverRegistry>,
    connector: Arc<dyn Connector>,
    logger: Option<JobLogger>,
    monitor_window: usize,
    os_confidence_threshold: u8,
}

/// Releases every account of its owner when dropped, unwinding included.
struct AccountLease<'a> {
    accounts: &'a AccountManager,
    owner: String,
}

impl Drop for AccountLease<'_> {
    fn drop(&mut self) {
        self.accounts.release_accounts(&self.owner);
    }
}

impl HostJobEnv {
    fn execute(&self, ctx: &JobContext, host: &Host, action: &HostAction) -> Result<(), FleetError> {
        let lease = AccountLease {
            accounts: &self.accounts,
            owner: format!("{}#{}", host.name(), ctx.id()),
        };
        self.open_and_run(ctx, host, action, &lease.owner)
    }

    fn open_and_run(
        &self,
        ctx: &JobContext,
        host: &Host,
        action: &HostAction,
        owner: &str,
    ) -> Result<(), FleetError> {
        let account = self.accounts.acquire_account_for(host, Some(owner))?;
        debug!(
            "Job '{}' logs into {} as '{}'",
            ctx.name(),
            host.address(),
            account.name()
        );
        let conn = self.connector.connect(host)?;
        let mut session = Session::new(host, conn, self.registry.clone())?
            .with_monitor_window(self.monitor_window)
            .with_os_confidence_threshold(self.os_confidence_threshold);
        if let Some(logger) = &self.logger {
            session = session.with_logger(logger.clone(), ctx.id());
        }
        session.login(&account)?;
        session.auto_init_terminal()?;
        action(ctx, host, &mut session)?;
        session.close()
    }
}

#[derive(Clone, Copy)]
enum Placement {
    Append,
    AppendUnique,
    Head,
    HeadOrRaise,
    Forced,
}

/// Runs actions against many hosts on a pool of worker threads.
pub struct Queue {
    config: QueueConfig,
    main_loop: MainLoop,
    accounts: Arc<AccountManager>,
    registry: Arc<DriverRegistry>,
    connector: Arc<dyn Connector>,
    logger: Option<JobLogger>,
    host_driver: Option<String>,
}

impl Queue {
    /// Creates a queue with the built-in drivers and starts its workers.
    pub fn new(connector: impl Connector + 'static, config: QueueConfig) -> Result<Self, FleetError> {
        config.validate()?;
        let registry = DriverRegistry::with_builtin_drivers()?.with_threshold(config.driver_threshold);
        let main_loop = MainLoop::from_config(&config)?;
        let queue = Self {
            main_loop,
            accounts: Arc::new(AccountManager::new()),
            registry: Arc::new(registry),
            connector: Arc::new(connector),
            logger: None,
            host_driver: None,
            config,
        };
        if queue.config.record_level == RecordLevel::Off {
            Ok(queue)
        } else {
            let logger = JobLogger::new(queue.config.record_level);
            Ok(queue.with_logger(logger))
        }
    }

    /// Replaces the driver registry used by later jobs.
    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Records job lifecycle events and session data into `logger`.
    pub fn with_logger(mut self, logger: JobLogger) -> Self {
        let sink = logger.clone();
        self.main_loop.set_observer(Some(Arc::new(move |id: JobId, event: &JobEvent| {
            if let Err(err) = sink.record(id, event.clone()) {
                warn!("Failed to record event of job {}: {}", id, err);
            }
        })));
        self.logger = Some(logger);
        self
    }

    /// Pins every later host to the named driver.
    pub fn with_host_driver(mut self, driver: impl Into<String>) -> Self {
        self.host_driver = Some(driver.into());
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn logger(&self) -> Option<&JobLogger> {
        self.logger.as_ref()
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn account_manager(&self) -> &AccountManager {
        &self.accounts
    }

    /// Adds an account to the default pool.
    pub fn add_account(&self, account: impl Into<Arc<Account>>) -> Arc<Account> {
        self.accounts.add_account(account)
    }

    /// Adds an account pool.
    ///
    /// Without a matcher the pool becomes the default pool. Accounts are
    /// chosen in this order: the account attached to the host, the first
    /// matched pool accepting the host, the default pool.
    pub fn add_account_pool(&self, pool: Arc<AccountPool>, matcher: Option<PoolMatcher>) {
        self.accounts.add_pool(pool, matcher);
    }

    pub fn set_max_threads(&self, max_threads: usize) {
        self.main_loop.set_max_threads(max_threads);
    }

    pub fn max_threads(&self) -> usize {
        self.main_loop.max_threads()
    }

    /// Runs `action` once per host, appending the jobs to the queue.
    ///
    /// `attempts` defaults to the configured number. Returns `None` if no
    /// host was given.
    pub fn run<I, F>(
        &self,
        hosts: I,
        action: F,
        attempts: Option<usize>,
    ) -> Result<Option<Task>, FleetError>
    where
        I: IntoIterator,
        I::Item: Into<Host>,
        F: Fn(&JobContext, &Host, &mut Session) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        self.submit(hosts, Arc::new(action), attempts, Placement::Append)
    }

    /// Like [`run`](Queue::run), but skips hosts that are already queued
    /// or running. Returns `None` if every host was skipped.
    pub fn run_or_ignore<I, F>(
        &self,
        hosts: I,
        action: F,
        attempts: Option<usize>,
    ) -> Result<Option<Task>, FleetError>
    where
        I: IntoIterator,
        I::Item: Into<Host>,
        F: Fn(&JobContext, &Host, &mut Session) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        self.submit(hosts, Arc::new(action), attempts, Placement::AppendUnique)
    }

    /// Like [`run`](Queue::run), but places the jobs at the head.
    pub fn priority_run<I, F>(
        &self,
        hosts: I,
        action: F,
        attempts: Option<usize>,
    ) -> Result<Option<Task>, FleetError>
    where
        I: IntoIterator,
        I::Item: Into<Host>,
        F: Fn(&JobContext, &Host, &mut Session) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        self.submit(hosts, Arc::new(action), attempts, Placement::Head)
    }

    /// Like [`priority_run`](Queue::priority_run), but a host that is
    /// already queued is moved to the head instead of being added again.
    pub fn priority_run_or_raise<I, F>(
        &self,
        hosts: I,
        action: F,
        attempts: Option<usize>,
    ) -> Result<Option<Task>, FleetError>
    where
        I: IntoIterator,
        I::Item: Into<Host>,
        F: Fn(&JobContext, &Host, &mut Session) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        self.submit(hosts, Arc::new(action), attempts, Placement::HeadOrRaise)
    }

    /// Starts one job per host at once, each on a thread of its own,
    /// even when every worker is busy. Retries are queued normally.
    pub fn force_run<I, F>(
        &self,
        hosts: I,
        action: F,
        attempts: Option<usize>,
    ) -> Result<Option<Task>, FleetError>
    where
        I: IntoIterator,
        I::Item: Into<Host>,
        F: Fn(&JobContext, &Host, &mut Session) -> Result<(), FleetError> + Send + Sync + 'static,
    {
        self.submit(hosts, Arc::new(action), attempts, Placement::Forced)
    }

    fn submit<I>(
        &self,
        hosts: I,
        action: HostAction,
        attempts: Option<usize>,
        placement: Placement,
    ) -> Result<Option<Task>, FleetError>
    where
        I: IntoIterator,
        I::Item: Into<Host>,
    {
        let env = HostJobEnv {
            accounts: self.accounts.clone(),
            registry: self.registry.clone(),
            connector: self.connector.clone(),
            logger: self.logger.clone(),
            monitor_window: self.config.monitor_window,
            os_confidence_threshold: self.config.os_confidence_threshold,
        };
        let times = attempts.unwrap_or(self.config.default_attempts);
        let mut ids = Vec::new();
        for host in hosts {
            let mut host: Host = host.into();
            if let Some(driver) = &self.host_driver {
                host = host.with_driver(driver.clone());
            }
            let name = host.name().to_string();
            let env = env.clone();
            let action = action.clone();
            let job = Job::new(move |ctx| env.execute(ctx, &host, &action))
                .with_name(name)
                .with_times(times);
            let id = match placement {
                Placement::Append => Some(self.main_loop.enqueue(job)?),
                Placement::AppendUnique => self.main_loop.enqueue_or_ignore(job)?,
                Placement::Head => Some(self.main_loop.priority_enqueue(job)?),
                Placement::HeadOrRaise => self.main_loop.priority_enqueue_or_raise(job)?,
                Placement::Forced => Some(self.main_loop.force_enqueue(job)?),
            };
            ids.extend(id);
        }
        if ids.is_empty() {
            debug!("No jobs enqueued");
            return Ok(None);
        }
        debug!("Enqueued {} host job(s)", ids.len());
        Ok(Some(Task {
            handle: self.main_loop.handle(),
            ids,
        }))
    }

    /// Enqueues a job that does not target a host.
    pub fn enqueue(&self, job: Job) -> Result<Task, FleetError> {
        let id = self.main_loop.enqueue(job)?;
        Ok(Task {
            handle: self.main_loop.handle(),
            ids: vec![id],
        })
    }

    /// True when every enqueued job has finished.
    pub fn is_completed(&self) -> bool {
        self.main_loop.is_completed()
    }

    pub fn progress(&self) -> Progress {
        self.main_loop.progress()
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        self.main_loop.failures()
    }

    /// Forgets finished jobs; see [`LoopHandle::clear_finished`].
    pub fn clear_finished(&self) -> usize {
        self.main_loop.clear_finished()
    }

    /// Blocks until every enqueued job has finished.
    pub fn join(&self) {
        self.main_loop.wait_until_done();
    }

    /// Stops executing jobs, then restarts the workers so the queue stays
    /// usable. Without `force`, queued jobs are processed first.
    pub fn shutdown(&self, force: bool) {
        self.halt(force);
        self.main_loop.restart();
    }

    /// Like [`shutdown`](Queue::shutdown), but also forgets all accounts
    /// and counters. The queue accepts no jobs afterwards.
    pub fn destroy(&self, force: bool) {
        if !force {
            self.join();
        }
        self.halt(true);
        self.main_loop.destroy();
        self.accounts.reset();
    }

    /// Forgets all accounts and drops queued jobs; the queue stays usable.
    pub fn reset(&self) {
        self.accounts.reset();
        self.halt(true);
        self.main_loop.restart();
    }

    /// Joins the workers. A forced halt also wakes jobs blocked waiting
    /// for an account, which then fail.
    fn halt(&self, force: bool) {
        if !force {
            self.main_loop.shutdown(false);
            return;
        }
        self.main_loop.stop();
        self.accounts.interrupt();
        self.main_loop.shutdown(true);
        self.accounts.resume();
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.halt(true);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("main_loop", &self.main_loop)
            .field("accounts", &self.accounts)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
