//! Recurring job scheduling.
//!
//! This module separates the *contract* for a recurring job from the *host*
//! that executes it:
//!
//! - [`PeriodicJob`] and [`Constraints`] are plain values describing a job:
//!   its unique name, its period and the device conditions that must hold
//!   before it may fire.
//! - [`JobScheduler`] is the interface a job is handed to, together with an
//!   [`ExistingJobPolicy`] deciding what happens when the name is taken.
//! - [`LocalScheduler`] is an in-process host built on tokio. It keeps one
//!   task per job, consults a [`ConditionProbe`] before each fire, retries
//!   failed fires with exponential backoff and persists the next fire time
//!   through a [`JobStateStore`] so restarts keep the cadence.
//!
//! # State machine
//!
//! ```text
//! Unregistered ──register──▶ Registered ──due + constraints──▶ Running
//!                                ▲                               │
//!                                ├────────── success ────────────┤
//!                                │                               ▼
//!                                └──── backoff elapsed ──── RetryPending
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

// ============================================================================
// Constraints
// ============================================================================

/// Network a job needs before it may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    NotRequired,
    Connected,
    Unmetered,
}

/// Network as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Disconnected,
    Metered,
    Unmetered,
}

/// A sample of the device state taken by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConditions {
    pub network: NetworkState,
    pub battery_low: bool,
    pub charging: bool,
    /// `None` when the platform cannot tell whether the device is idle.
    pub idle: Option<bool>,
}

/// Preconditions that must all hold at the moment a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Constraints {
    pub required_network: NetworkType,
    pub requires_battery_not_low: bool,
    pub requires_charging: bool,
    pub requires_device_idle: bool,
}

impl Constraints {
    /// No preconditions at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, network: NetworkType) -> Self {
        self.required_network = network;
        self
    }

    pub fn with_battery_not_low(mut self, required: bool) -> Self {
        self.requires_battery_not_low = required;
        self
    }

    pub fn with_charging(mut self, required: bool) -> Self {
        self.requires_charging = required;
        self
    }

    pub fn with_device_idle(mut self, required: bool) -> Self {
        self.requires_device_idle = required;
        self
    }

    /// Preconditions for the catalog refresh: unmetered network, battery not
    /// low, charging, and device idle where the platform can tell.
    pub fn refresh_defaults(idle_supported: bool) -> Self {
        Self::none()
            .with_network(NetworkType::Unmetered)
            .with_battery_not_low(true)
            .with_charging(true)
            .with_device_idle(idle_supported)
    }

    /// Whether a job with these constraints may fire under `conditions`.
    ///
    /// An idle requirement is best effort: it passes when the host cannot
    /// report idleness.
    pub fn satisfied_by(&self, conditions: &DeviceConditions) -> bool {
        let network_ok = match self.required_network {
            NetworkType::NotRequired => true,
            NetworkType::Connected => conditions.network != NetworkState::Disconnected,
            NetworkType::Unmetered => conditions.network == NetworkState::Unmetered,
        };

        network_ok
            && (!self.requires_battery_not_low || !conditions.battery_low)
            && (!self.requires_charging || conditions.charging)
            && (!self.requires_device_idle || conditions.idle.unwrap_or(true))
    }
}

// ============================================================================
// Job Contract
// ============================================================================

/// A named recurring job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicJob {
    pub name: String,
    pub period: Duration,
    pub constraints: Constraints,
}

impl PeriodicJob {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            constraints: Constraints::none(),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Unique name of the catalog refresh job.
pub const REFRESH_JOB_NAME: &str = "catalog-refresh";

/// Period of the catalog refresh job.
pub const REFRESH_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// The daily catalog refresh job.
pub fn refresh_job(idle_supported: bool) -> PeriodicJob {
    PeriodicJob::new(REFRESH_JOB_NAME, REFRESH_PERIOD)
        .with_constraints(Constraints::refresh_defaults(idle_supported))
}

/// What to do when a job is registered under a name that is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingJobPolicy {
    /// Keep the existing registration and discard the new request.
    #[default]
    Keep,
    /// Cancel the existing registration and start over with the new one.
    Replace,
}

/// Result of one fire of a job body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// The body failed; the host should try again later.
    Retry(String),
}

/// The body of a recurring job.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> JobOutcome;
}

/// What a registration call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Registered,
    KeptExisting,
    Replaced,
}

/// Interface a recurring job is handed to.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn enqueue_unique_periodic(
        &self,
        job: PeriodicJob,
        policy: ExistingJobPolicy,
        work: Arc<dyn Job>,
    ) -> Result<Enqueued>;
}

/// Where a host keeps next fire times between process runs.
pub trait JobStateStore: Send + Sync {
    fn next_run(&self, job_name: &str) -> Result<Option<DateTime<Utc>>>;

    fn set_next_run(&self, job_name: &str, next_run: DateTime<Utc>) -> Result<()>;
}

/// Source of [`DeviceConditions`] for the host.
pub trait ConditionProbe: Send + Sync {
    fn sample(&self) -> DeviceConditions;

    /// Whether [`DeviceConditions::idle`] is meaningful on this platform.
    fn supports_idle(&self) -> bool {
        false
    }
}

/// A probe that always reports the same conditions.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    conditions: DeviceConditions,
}

impl StaticProbe {
    pub fn new(conditions: DeviceConditions) -> Self {
        Self { conditions }
    }
}

impl ConditionProbe for StaticProbe {
    fn sample(&self) -> DeviceConditions {
        self.conditions
    }

    fn supports_idle(&self) -> bool {
        self.conditions.idle.is_some()
    }
}

// ============================================================================
// Job State Types
// ============================================================================

/// Where a registered job is in its cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for the next fire time or for its constraints.
    Registered,
    /// The body is executing.
    Running,
    /// The last fire failed; waiting out the backoff.
    RetryPending,
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    /// Earliest time the job may fire again.
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of consecutive failed fires.
    pub error_count: u32,
    pub run_count: u64,
}

impl JobStatus {
    fn new(name: String, next_run: DateTime<Utc>) -> Self {
        Self {
            name,
            state: JobState::Registered,
            next_run,
            last_run: None,
            last_error: None,
            error_count: 0,
            run_count: 0,
        }
    }
}

/// Delay before retrying after `error_count` consecutive failures.
///
/// 2^n minutes, at most 60 minutes, and never longer than the job period.
pub fn retry_delay(error_count: u32, period: Duration) -> Duration {
    let backoff_minutes = 2_u64.pow(error_count.min(6)).min(60);
    Duration::from_secs(backoff_minutes * 60).min(period)
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

// ============================================================================
// LocalScheduler
// ============================================================================

struct JobEntry {
    job: PeriodicJob,
    generation: u64,
    work: Arc<dyn Job>,
    run_lock: Arc<Mutex<()>>,
    status: JobStatus,
    next_fire: Instant,
    handle: Option<JoinHandle<()>>,
}

type JobTable = Arc<RwLock<HashMap<String, JobEntry>>>;

/// In-process scheduler host.
///
/// Each registered job gets its own tokio task that sleeps until the job is
/// due, waits for its constraints, and runs the body. The body of a job never
/// runs twice at once: the task and [`LocalScheduler::trigger_now`] share a
/// per-job run lock.
pub struct LocalScheduler {
    jobs: JobTable,
    probe: Arc<dyn ConditionProbe>,
    state_store: Option<Arc<dyn JobStateStore>>,
    condition_poll: Duration,
    shutdown_tx: broadcast::Sender<()>,
    is_shut_down: AtomicBool,
    next_generation: AtomicU64,
}

impl LocalScheduler {
    /// Create a scheduler that evaluates constraints with `probe`.
    pub fn new(probe: Arc<dyn ConditionProbe>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            probe,
            state_store: None,
            condition_poll: Duration::from_secs(60),
            shutdown_tx,
            is_shut_down: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Persist next fire times in `store`.
    pub fn with_state_store(mut self, store: Arc<dyn JobStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// How often unmet constraints are re-evaluated.
    pub fn with_condition_poll(mut self, interval: Duration) -> Self {
        self.condition_poll = interval;
        self
    }

    /// Whether the host can evaluate an idle constraint.
    pub fn supports_idle(&self) -> bool {
        self.probe.supports_idle()
    }

    /// Get the status of one job.
    pub async fn status(&self, name: &str) -> Option<JobStatus> {
        self.jobs.read().await.get(name).map(|entry| entry.status.clone())
    }

    /// Get the status of every registered job.
    pub async fn statuses(&self) -> HashMap<String, JobStatus> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.clone()))
            .collect()
    }

    /// Run a job now, outside its schedule.
    ///
    /// Waits for an in-flight fire of the same job to finish first.
    /// Constraints are not consulted.
    pub async fn trigger_now(&self, name: &str) -> Result<JobOutcome> {
        info!("Manual run triggered for job '{}'", name);

        let context = {
            let jobs = self.jobs.read().await;
            let entry = jobs
                .get(name)
                .with_context(|| format!("Job '{}' is not registered", name))?;
            self.context_for(entry)
        };

        Ok(context.fire().await)
    }

    /// Stop every job task.
    ///
    /// Tasks finish the fire they are in, if any; registrations after this
    /// call are rejected.
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler");
        self.is_shut_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut jobs = self.jobs.write().await;
            jobs.iter_mut()
                .filter_map(|(name, entry)| entry.handle.take().map(|h| (name.clone(), h)))
                .collect()
        };

        for (name, handle) in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Job '{}' did not stop in time, aborting", name);
                abort.abort();
            }
        }

        info!("Scheduler shutdown complete");
    }

    fn context_for(&self, entry: &JobEntry) -> JobContext {
        JobContext {
            job: entry.job.clone(),
            generation: entry.generation,
            work: Arc::clone(&entry.work),
            run_lock: Arc::clone(&entry.run_lock),
            jobs: Arc::clone(&self.jobs),
            probe: Arc::clone(&self.probe),
            state_store: self.state_store.clone(),
            condition_poll: self.condition_poll,
        }
    }

    /// Delay before the first fire of a fresh registration.
    fn initial_delay(&self, job: &PeriodicJob) -> Duration {
        let Some(store) = &self.state_store else {
            return Duration::ZERO;
        };

        match store.next_run(&job.name) {
            Ok(Some(next_run)) => {
                let delay = (next_run - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!("Restored next run for job '{}': {}", job.name, next_run);
                delay.min(job.period)
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!("Failed to read persisted state for job '{}': {}", job.name, e);
                Duration::ZERO
            }
        }
    }
}

#[async_trait]
impl JobScheduler for LocalScheduler {
    async fn enqueue_unique_periodic(
        &self,
        job: PeriodicJob,
        policy: ExistingJobPolicy,
        work: Arc<dyn Job>,
    ) -> Result<Enqueued> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            anyhow::bail!("Scheduler is shut down, cannot register '{}'", job.name);
        }
        if job.period.is_zero() {
            anyhow::bail!("Job '{}' must have a non-zero period", job.name);
        }

        let mut jobs = self.jobs.write().await;

        // A replacing registration inherits the run lock, so it waits for a
        // body the old registration already started.
        let inherited_lock = match (jobs.get_mut(&job.name), policy) {
            (Some(_), ExistingJobPolicy::Keep) => {
                info!(
                    "Job '{}' already registered, keeping existing schedule",
                    job.name
                );
                return Ok(Enqueued::KeptExisting);
            }
            (Some(existing), ExistingJobPolicy::Replace) => {
                info!("Replacing existing registration of job '{}'", job.name);
                if let Some(handle) = existing.handle.take() {
                    handle.abort();
                }
                Some(Arc::clone(&existing.run_lock))
            }
            (None, _) => None,
        };
        let replaced = inherited_lock.is_some();

        let delay = if replaced {
            Duration::ZERO
        } else {
            self.initial_delay(&job)
        };
        let next_run = wall_clock_after(delay);

        if let Some(store) = &self.state_store {
            if let Err(e) = store.set_next_run(&job.name, next_run) {
                warn!("Failed to persist next run for job '{}': {}", job.name, e);
            }
        }

        let entry = JobEntry {
            job: job.clone(),
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            work,
            run_lock: inherited_lock.unwrap_or_else(|| Arc::new(Mutex::new(()))),
            status: JobStatus::new(job.name.clone(), next_run),
            next_fire: Instant::now() + delay,
            handle: None,
        };

        let context = self.context_for(&entry);
        jobs.insert(job.name.clone(), entry);

        let handle = tokio::spawn(context.run_loop(self.shutdown_tx.subscribe()));
        if let Some(entry) = jobs.get_mut(&job.name) {
            entry.handle = Some(handle);
        }

        info!(
            "Registered job '{}' every {:?}, next run at {}",
            job.name, job.period, next_run
        );

        Ok(if replaced {
            Enqueued::Replaced
        } else {
            Enqueued::Registered
        })
    }
}

// ============================================================================
// Job Task
// ============================================================================

/// Everything one job's task needs, detached from the scheduler itself.
#[derive(Clone)]
struct JobContext {
    job: PeriodicJob,
    generation: u64,
    work: Arc<dyn Job>,
    run_lock: Arc<Mutex<()>>,
    jobs: JobTable,
    probe: Arc<dyn ConditionProbe>,
    state_store: Option<Arc<dyn JobStateStore>>,
    condition_poll: Duration,
}

impl JobContext {
    async fn run_loop(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let name = self.job.name.clone();

        loop {
            let Some(next_fire) = self.next_fire().await else {
                debug!("Job '{}' was unregistered or replaced", name);
                break;
            };

            if Instant::now() < next_fire {
                tokio::select! {
                    _ = sleep_until(next_fire) => continue,
                    _ = shutdown_rx.recv() => break,
                }
            }

            if !self.wait_for_constraints(&mut shutdown_rx).await {
                break;
            }

            self.fire_if_due().await;
        }

        info!("Task for job '{}' stopped", name);
    }

    async fn next_fire(&self) -> Option<Instant> {
        let jobs = self.jobs.read().await;
        jobs.get(&self.job.name)
            .filter(|entry| entry.generation == self.generation)
            .map(|entry| entry.next_fire)
    }

    /// Returns `false` if shutdown was signalled while waiting.
    async fn wait_for_constraints(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        loop {
            let conditions = self.probe.sample();
            if self.job.constraints.satisfied_by(&conditions) {
                return true;
            }

            debug!(
                "Job '{}' is due but constraints are not met ({:?}), deferring",
                self.job.name, conditions
            );

            tokio::select! {
                _ = sleep(self.condition_poll) => {}
                _ = shutdown_rx.recv() => return false,
            }
        }
    }

    /// Apply `update` to this job's entry if it is still the current registration.
    async fn update_entry(&self, update: impl FnOnce(&mut JobEntry)) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs
            .get_mut(&self.job.name)
            .filter(|entry| entry.generation == self.generation)
        {
            update(entry);
        }
    }

    /// Run the body now, waiting for any in-flight fire of the same job.
    async fn fire(&self) -> JobOutcome {
        let guard = Arc::clone(&self.run_lock).lock_owned().await;
        self.run_locked(guard).await
    }

    /// Scheduled fire. A manual run that finished while this one waited for
    /// the lock has already moved the next fire time, in which case it is skipped.
    async fn fire_if_due(&self) {
        let guard = Arc::clone(&self.run_lock).lock_owned().await;
        match self.next_fire().await {
            Some(next_fire) if next_fire <= Instant::now() => {
                self.run_locked(guard).await;
            }
            _ => debug!(
                "Job '{}' was rescheduled while waiting to run, skipping",
                self.job.name
            ),
        }
    }

    async fn run_locked(&self, guard: OwnedMutexGuard<()>) -> JobOutcome {
        let name = self.job.name.as_str();
        let started = Utc::now();

        self.update_entry(|entry| entry.status.state = JobState::Running)
            .await;
        debug!("Running job '{}'", name);

        let work = Arc::clone(&self.work);
        let run_start = std::time::Instant::now();
        // The guard travels with the body: aborting this task must not free
        // the lock while the body is still running. It comes back so the
        // outcome is recorded before the next fire can start.
        let body = tokio::spawn(async move {
            let outcome = work.run().await;
            (outcome, guard)
        });
        let (outcome, _guard) = match body.await {
            Ok((outcome, guard)) => (outcome, Some(guard)),
            Err(e) => (JobOutcome::Retry(format!("Job body aborted: {}", e)), None),
        };
        let duration = run_start.elapsed();

        let mut next_run = None;
        let period = self.job.period;
        let recorded = outcome.clone();
        self.update_entry(|entry| {
            let status = &mut entry.status;
            status.last_run = Some(started);
            status.run_count += 1;

            let delay = match recorded {
                JobOutcome::Success => {
                    status.state = JobState::Registered;
                    status.error_count = 0;
                    status.last_error = None;
                    period
                }
                JobOutcome::Retry(message) => {
                    status.state = JobState::RetryPending;
                    status.error_count += 1;
                    status.last_error = Some(message);
                    retry_delay(status.error_count, period)
                }
            };

            entry.next_fire = Instant::now() + delay;
            status.next_run = wall_clock_after(delay);
            next_run = Some(status.next_run);
        })
        .await;

        match &outcome {
            JobOutcome::Success => info!("Job '{}' succeeded in {:?}", name, duration),
            JobOutcome::Retry(message) => {
                error!("Job '{}' failed after {:?}: {}", name, duration, message)
            }
        }

        if let (Some(store), Some(next_run)) = (&self.state_store, next_run) {
            if let Err(e) = store.set_next_run(name, next_run) {
                warn!("Failed to persist next run for job '{}': {}", name, e);
            }
        }

        outcome
    }
}

// ============================================================================
// Tests
// ============================================================================
