//! Job scheduling for the browser pool.
//!
//! [`BrowserPool`] owns a fixed set of workers, the job queue, per-job
//! pending counters and the callback table. Producers [`queue`] jobs along
//! with a [`CallbackRef`]; workers [`pop`] them, run them against their
//! browser and hand results to [`handle_job_result`], which dispatches them
//! to the registered callback before [`job_done`] settles the books.
//!
//! Two variants share this core:
//!
//! - **Pool** ([`BrowserPool::bounded`]): producers take an admission slot
//!   before their job is accepted and block when all slots are in use.
//! - **Cluster** ([`BrowserPool::cluster`]): admits everything.
//!
//! [`queue`]: BrowserPool::queue
//! [`pop`]: BrowserPool::pop
//! [`handle_job_result`]: BrowserPool::handle_job_result
//! [`job_done`]: BrowserPool::job_done

pub(crate) mod admission;
pub mod callbacks;
pub mod context;
pub mod job;
pub mod observers;
pub mod queue;
pub mod state;
pub mod stats;

pub use callbacks::{
    BrowserHandler, CallbackRef, CallbackRegistry, Delivery, Handler, HandlerKind, ResultHandler,
};
pub use context::PoolContext;
pub use job::{Job, JobId, JobKind, JobResult};
pub use observers::Observers;
pub use queue::{JobQueue, Preference};
pub use state::{SkipStates, StateDump};
pub use stats::{Statistics, StatisticsSnapshot};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Notify;

use crate::browser::{BrowserConnector, Resource};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::jobs::{DomExploration, ExplorationOptions, TaintSpec, TaintTrace};
use crate::worker::{Worker, WorkerHandle, WorkerStatus};

use admission::{Admission, SlotGuard};
use state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Admission-bounded
    Pool,
    /// Unbounded
    Cluster,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Pool => write!(f, "pool"),
            Variant::Cluster => write!(f, "cluster"),
        }
    }
}

struct Inner {
    variant: Variant,
    config: PoolConfig,
    context: Arc<PoolContext>,
    connector: Arc<dyn BrowserConnector>,
    state: Mutex<State>,
    admission: Admission,
    skip_states: SkipStates,
    observers: Observers,
    /// Signalled once per queued job
    job_available: Notify,
    /// Signalled when the pending job counter reaches zero
    all_done: Notify,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
}

/// Handle to a scheduler. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<Inner>,
}

impl fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserPool")
            .field("variant", &self.inner.variant)
            .field("size", &self.inner.config.size)
            .field("pending_job_counter", &self.pending_job_counter())
            .finish()
    }
}

enum Popped {
    Job(Job),
    Empty,
    Shutdown,
}

impl BrowserPool {
    /// Spawns an admission-bounded pool of `config.size` workers.
    ///
    /// # Errors
    ///
    /// Fails if any engine process cannot be spawned or connected to; the
    /// workers spawned so far are shut down.
    pub async fn bounded(
        config: PoolConfig,
        context: Arc<PoolContext>,
        connector: Arc<dyn BrowserConnector>,
    ) -> Result<Self> {
        let pool = Self::new(Variant::Pool, config, context, connector, State::default());
        pool.start().await?;
        Ok(pool)
    }

    /// Spawns an unbounded cluster of `config.size` workers.
    pub async fn cluster(
        config: PoolConfig,
        context: Arc<PoolContext>,
        connector: Arc<dyn BrowserConnector>,
    ) -> Result<Self> {
        let pool = Self::new(Variant::Cluster, config, context, connector, State::default());
        pool.start().await?;
        Ok(pool)
    }

    fn new(
        variant: Variant,
        config: PoolConfig,
        context: Arc<PoolContext>,
        connector: Arc<dyn BrowserConnector>,
        mut state: State,
    ) -> Self {
        let admission = match variant {
            Variant::Pool => Admission::bounded(config.job_queue_size),
            Variant::Cluster => Admission::Unbounded,
        };
        if state.queue.is_empty() {
            state.queue = JobQueue::new(config.queue.clone());
        }

        Self {
            inner: Arc::new(Inner {
                variant,
                config,
                context,
                connector,
                state: Mutex::new(state),
                admission,
                skip_states: SkipStates::new(),
                observers: Observers::new(),
                job_available: Notify::new(),
                all_done: Notify::new(),
                workers: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    async fn start(&self) -> Result<()> {
        let size = self.inner.config.size;
        tracing::info!(
            variant = %self.inner.variant,
            size,
            engine = %self.inner.config.engine.kind,
            "Initializing browsers"
        );

        let spawned: Vec<Result<Worker>> = match self.inner.variant {
            Variant::Pool => {
                futures::future::join_all((0..size).map(|id| Worker::spawn(id, self.clone())))
                    .await
            }
            Variant::Cluster => {
                let mut spawned = Vec::with_capacity(size);
                for id in 0..size {
                    spawned.push(Worker::spawn(id, self.clone()).await);
                }
                spawned
            }
        };

        let mut workers = Vec::with_capacity(size);
        let mut failure = None;
        for worker in spawned {
            match worker {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to spawn worker");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            // Dropping the workers kills their engines.
            drop(workers);
            self.lock().shutdown = true;
            self.inner.admission.close();
            return Err(e);
        }

        let handles: Vec<WorkerHandle> = workers.into_iter().map(Worker::start).collect();
        tracing::info!(
            workers = handles.len(),
            "Initialization completed"
        );
        *self.inner.workers.lock().await = handles;
        Ok(())
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Queues `job`; its results go to `callback`.
    ///
    /// The bounded variant blocks here, outside the scheduler lock, until an
    /// admission slot is free.
    ///
    /// # Errors
    ///
    /// - [`PoolError::AlreadyShutdown`] after [`shutdown`](Self::shutdown)
    /// - [`PoolError::AlreadyDone`] if `job` has already been marked done
    /// - [`PoolError::UnknownCallback`] / [`PoolError::CallbackKind`] if
    ///   `callback` does not resolve to a handler fit for the job
    pub async fn queue(&self, job: Job, callback: CallbackRef) -> Result<()> {
        self.check_queueable(&job, &callback)?;
        self.inner.admission.acquire().await?;
        self.enqueue(job, callback)
    }

    /// Like [`queue`](Self::queue) but gives up instead of blocking when no
    /// admission slot is free. Returns whether the job was queued.
    pub fn try_queue(&self, job: Job, callback: CallbackRef) -> Result<bool> {
        self.check_queueable(&job, &callback)?;
        if !self.inner.admission.try_acquire()? {
            return Ok(false);
        }
        self.enqueue(job, callback)?;
        Ok(true)
    }

    fn check_queueable(&self, job: &Job, callback: &CallbackRef) -> Result<()> {
        self.fail_if_shutdown()?;

        let expected = match job.kind {
            JobKind::BrowserProvider => HandlerKind::Browser,
            _ => HandlerKind::Result,
        };
        self.inner.context.callbacks().resolve_as(callback, expected)?;

        if self.is_job_done(job, false)? {
            return Err(PoolError::AlreadyDone(job.id));
        }
        Ok(())
    }

    /// Registers and enqueues a job whose admission slot is already held.
    fn enqueue(&self, job: Job, callback: CallbackRef) -> Result<()> {
        let pushed = {
            let mut state = self.lock();
            if state.shutdown {
                Err(PoolError::AlreadyShutdown)
            } else {
                state.queue.push(job.clone()).map(|()| {
                    state.pending_job_counter += 1;
                    *state.pending.entry(job.id).or_insert(0) += 1;
                    state.callbacks.insert(job.id, callback);
                })
            }
        };
        if let Err(e) = pushed {
            self.inner.admission.release();
            return Err(e);
        }

        tracing::debug!(job_id = %job.id, job = %job, "Queued job");
        self.inner.context.statistics().increment_queued_job_count();
        self.inner.context.observers().notify_on_queue(&job);
        self.inner.observers.notify_on_queue(&job);
        self.inner.job_available.notify_one();
        Ok(())
    }

    /// Queues a [`DomExploration`] of `resource`.
    pub async fn explore(
        &self,
        resource: impl Into<Resource>,
        options: ExplorationOptions,
        callback: CallbackRef,
    ) -> Result<()> {
        let job = Job::new(JobKind::DomExploration(DomExploration {
            resource: resource.into(),
            options,
        }));
        self.queue(job, callback).await
    }

    /// Queues a [`TaintTrace`] of `resource`.
    pub async fn trace_taint(
        &self,
        resource: impl Into<Resource>,
        taint: TaintSpec,
        options: ExplorationOptions,
        callback: CallbackRef,
    ) -> Result<()> {
        let job = Job::new(JobKind::TaintTrace(TaintTrace {
            resource: resource.into(),
            taint,
            options,
        }));
        self.queue(job, callback).await
    }

    /// Leases a worker to the browser handler `callback`, passing it `args`.
    pub async fn with_browser(&self, args: Vec<Value>, callback: CallbackRef) -> Result<()> {
        self.queue(Job::browser_provider(args), callback).await
    }

    /// Like [`with_browser`](Self::with_browser), letting `tap` adjust the
    /// lease job (category, never-ending) before it is queued.
    pub async fn with_browser_and_tap(
        &self,
        tap: impl FnOnce(Job) -> Job,
        args: Vec<Value>,
        callback: CallbackRef,
    ) -> Result<()> {
        self.queue(tap(Job::browser_provider(args)), callback).await
    }

    /// Sets the function picking which job category to favour.
    pub fn prefer(&self, preference: impl Fn() -> Option<String> + Send + Sync + 'static) {
        self.lock().queue.set_preference(Some(Arc::new(preference)));
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Waits for the next live job. Jobs marked done while queued are
    /// discarded. Returns `None` once the scheduler shuts down.
    pub async fn pop(&self) -> Option<Job> {
        loop {
            let notified = self.inner.job_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_pop() {
                Popped::Job(job) => return Some(job),
                Popped::Shutdown => return None,
                Popped::Empty => notified.await,
            }
        }
    }

    fn try_pop(&self) -> Popped {
        let mut lost = Vec::new();
        let popped = {
            let mut state = self.lock();
            loop {
                if state.shutdown {
                    break Popped::Shutdown;
                }
                match state.queue.pop() {
                    Ok(Some(job)) if state.is_job_done(&job) => {
                        tracing::debug!(job_id = %job.id, "Discarding stale job");
                    }
                    Ok(Some(job)) => break Popped::Job(job),
                    Ok(None) => break Popped::Empty,
                    Err(PoolError::LostJob { id, reason }) => {
                        tracing::error!(job_id = %id, reason = %reason, "Dropping unreadable job");
                        settle(&mut state, id, false);
                        lost.push((id, state.pending_job_counter == 0));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to pop job");
                        break Popped::Empty;
                    }
                }
            }
        };

        for (id, all_done) in lost {
            self.lost_job_done(id, all_done);
        }

        if let Popped::Job(job) = &popped {
            tracing::debug!(job_id = %job.id, job = %job, "Popped job");
            self.inner.context.observers().notify_on_pop(job);
            self.inner.observers.notify_on_pop(job);
        }
        popped
    }

    /// Marks one instance of `job` as finished.
    ///
    /// Removes its callback unless it is never-ending, wakes
    /// [`wait`](Self::wait)ers when nothing is left pending and, for the
    /// bounded variant, always returns exactly one admission slot.
    pub fn job_done(&self, job: &Job) {
        let _slot = SlotGuard(&self.inner.admission);

        let all_done = {
            let mut state = self.lock();
            settle(&mut state, job.id, job.never_ending);
            state.pending_job_counter == 0
        };

        let statistics = self.inner.context.statistics();
        statistics.increment_completed_job_count();
        if let Some(time) = job.time {
            statistics.add_to_total_job_time(time);
        }

        tracing::debug!(job_id = %job.id, job = %job, "Done");
        self.inner.context.observers().notify_on_job_done(job);
        self.inner.observers.notify_on_job_done(job);

        self.wake_if_all_done(all_done);
    }

    /// Finishes the books of a queued job that could not be read back. Its
    /// payload is gone, so job observers are not notified.
    fn lost_job_done(&self, id: JobId, all_done: bool) {
        let _slot = SlotGuard(&self.inner.admission);

        let statistics = self.inner.context.statistics();
        statistics.increment_completed_job_count();
        statistics.increment_failed_count();

        tracing::debug!(job_id = %id, "Done (lost)");
        self.wake_if_all_done(all_done);
    }

    fn wake_if_all_done(&self, all_done: bool) {
        if all_done {
            tracing::debug!("Pending job counter reached 0");
            self.inner.all_done.notify_waiters();
        }
    }

    /// Whether `job` has been marked done. Never-ending jobs never are.
    ///
    /// # Errors
    ///
    /// [`PoolError::JobNotFound`] if `fail_if_not_found` is set and the job
    /// was never queued here.
    pub fn is_job_done(&self, job: &Job, fail_if_not_found: bool) -> Result<bool> {
        if job.never_ending {
            return Ok(false);
        }

        let state = self.lock();
        if fail_if_not_found && !state.pending.contains_key(&job.id) {
            return Err(PoolError::JobNotFound(job.id));
        }
        Ok(state.is_job_done(job))
    }

    /// Dispatches `result` to its job's callback.
    ///
    /// No-op after shutdown or once the job is done. Callback errors and
    /// panics are logged and suppressed.
    pub async fn handle_job_result(&self, result: JobResult) {
        let callback = {
            let state = self.lock();
            if state.shutdown || state.is_job_done(&result.job) {
                return;
            }
            state.callbacks.get(&result.job.id).cloned()
        };
        let Some(callback) = callback else {
            tracing::warn!(job_id = %result.job.id, "No callback registered for result");
            return;
        };

        tracing::debug!(job_id = %result.job.id, callback = %callback, "Got {}", result);
        self.inner.context.observers().notify_on_result(&result);
        self.inner.observers.notify_on_result(&result);

        let handler = match self.inner.context.callbacks().resolve_result(&callback) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(job_id = %result.job.id, error = %e, "Cannot deliver result");
                return;
            }
        };

        let job_id = result.job.id;
        let delivery = Delivery {
            args: result.job.args.clone(),
            result,
            pool: self.clone(),
        };
        let outcome = AssertUnwindSafe(async move { handler(delivery).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(job_id = %job_id, callback = %callback, error = %format!("{:#}", e), "Callback failed");
            }
            Err(_) => {
                tracing::error!(job_id = %job_id, callback = %callback, "Callback panicked");
            }
        }
    }

    /// The callback registered for `id`, if any.
    pub fn callback_for(&self, id: JobId) -> Option<CallbackRef> {
        self.lock().callbacks.get(&id).cloned()
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Whether nothing is pending.
    pub fn done(&self) -> Result<bool> {
        let state = self.lock();
        if state.shutdown {
            return Err(PoolError::AlreadyShutdown);
        }
        Ok(state.pending_job_counter == 0)
    }

    pub fn pending_job_counter(&self) -> usize {
        self.lock().pending_job_counter
    }

    /// Blocks until nothing is pending.
    ///
    /// # Errors
    ///
    /// [`PoolError::AlreadyShutdown`] if the scheduler is (or gets) shut down.
    pub async fn wait(&self) -> Result<&Self> {
        tracing::debug!("Waiting to finish");
        loop {
            let notified = self.inner.all_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.shutdown {
                    return Err(PoolError::AlreadyShutdown);
                }
                if state.pending_job_counter == 0 {
                    break;
                }
            }
            notified.await;
        }
        tracing::debug!("Finished");
        Ok(self)
    }

    // ========================================================================
    // Shutdown / suspend
    // ========================================================================

    /// Shuts the scheduler down: drops queued jobs, shuts every worker down
    /// (waiting for in-flight jobs if `wait`), then clears callbacks and
    /// counters.
    ///
    /// Returns false if the scheduler was already shut down.
    pub async fn shutdown(&self, wait: bool) -> bool {
        {
            let mut state = self.lock();
            if state.shutdown {
                return false;
            }
            state.shutdown = true;
        }
        tracing::info!(variant = %self.inner.variant, wait, "Shutting down");

        self.inner.admission.close();
        self.inner.job_available.notify_waiters();
        self.inner.all_done.notify_waiters();

        // Also removes spilled jobs from disk.
        self.lock().queue.clear();

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        shutdown_workers(workers, wait).await;

        // Last, interrupted jobs may still need them.
        {
            let mut state = self.lock();
            state.callbacks.clear();
            state.pending.clear();
            state.pending_job_counter = 0;
        }

        tracing::info!("Shutdown complete");
        true
    }

    /// Stops the workers, letting in-flight jobs finish, and dumps the
    /// remaining work to `directory` so [`restore`](Self::restore) can
    /// resume it. The scheduler is shut down afterwards.
    pub async fn suspend(&self, directory: &Path) -> Result<()> {
        self.fail_if_shutdown()?;
        tracing::info!(directory = %directory.display(), "Suspending");

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        shutdown_workers(workers, true).await;

        let dump = {
            let state = self.lock();
            let mut pending: Vec<(JobId, usize)> =
                state.pending.iter().map(|(id, n)| (*id, *n)).collect();
            pending.sort();
            let mut callbacks: Vec<(JobId, CallbackRef)> = state
                .callbacks
                .iter()
                .map(|(id, cb)| (*id, cb.clone()))
                .collect();
            callbacks.sort_by_key(|(id, _)| *id);

            StateDump {
                jobs: state.queue.snapshot()?,
                pending,
                pending_job_counter: state.pending_job_counter,
                callbacks,
                skip_states: self.inner.skip_states.digests(),
                statistics: self.inner.context.statistics().snapshot(),
            }
        };
        dump.dump(directory)?;

        self.shutdown(false).await;
        Ok(())
    }

    /// Rebuilds a scheduler from a [`suspend`](Self::suspend)ed dump and
    /// spawns its workers.
    ///
    /// # Errors
    ///
    /// [`PoolError::UnknownCallback`] if a dumped callback is not registered
    /// in `context`, plus the errors of [`bounded`](Self::bounded).
    pub async fn restore(
        directory: &Path,
        variant: Variant,
        config: PoolConfig,
        context: Arc<PoolContext>,
        connector: Arc<dyn BrowserConnector>,
    ) -> Result<Self> {
        let dump = StateDump::load(directory)?;
        for (_, callback) in &dump.callbacks {
            if context.callbacks().resolve(callback).is_none() {
                return Err(PoolError::UnknownCallback(callback.clone()));
            }
        }

        let queue = JobQueue::from_jobs(config.queue.clone(), dump.jobs)?;
        let state = State {
            queue,
            pending: dump.pending.into_iter().collect(),
            pending_job_counter: dump.pending_job_counter,
            callbacks: dump.callbacks.into_iter().collect(),
            shutdown: false,
        };
        context.statistics().restore(&dump.statistics);

        let pool = Self::new(variant, config, context, connector, state);
        pool.inner.skip_states.merge(dump.skip_states);

        // Pending work holds slots just like it did before suspending.
        if let Some(capacity) = pool.inner.admission.capacity() {
            for _ in 0..dump.pending_job_counter.min(capacity) {
                pool.inner.admission.try_acquire()?;
            }
        }

        tracing::info!(
            directory = %directory.display(),
            pending = dump.pending_job_counter,
            queued = pool.queue_size(),
            "Restored browser pool state"
        );

        pool.start().await?;
        Ok(pool)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn variant(&self) -> Variant {
        self.inner.variant
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &Arc<PoolContext> {
        &self.inner.context
    }

    pub(crate) fn connector(&self) -> &Arc<dyn BrowserConnector> {
        &self.inner.connector
    }

    /// Aggregate statistics of the context this scheduler belongs to.
    pub fn statistics(&self) -> &Statistics {
        self.inner.context.statistics()
    }

    /// Instance-level observers.
    pub fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    /// Browser states already processed by any worker of this scheduler.
    pub fn skip_states(&self) -> &SkipStates {
        &self.inner.skip_states
    }

    pub fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    /// Admission capacity, `None` for the cluster variant.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.admission.capacity()
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub async fn workers(&self) -> Vec<WorkerStatus> {
        self.inner
            .workers
            .lock()
            .await
            .iter()
            .map(WorkerHandle::status)
            .collect()
    }

    fn fail_if_shutdown(&self) -> Result<()> {
        if self.lock().shutdown {
            return Err(PoolError::AlreadyShutdown);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decrements the counters of one instance of job `id`.
fn settle(state: &mut State, id: JobId, never_ending: bool) {
    state.pending_job_counter = state.pending_job_counter.saturating_sub(1);
    if let Some(count) = state.pending.get_mut(&id) {
        *count = count.saturating_sub(1);
    }
    if !never_ending {
        state.callbacks.remove(&id);
    }
}

/// Shuts workers down concurrently; one failing doesn't stop the rest.
async fn shutdown_workers(workers: Vec<WorkerHandle>, wait: bool) {
    if workers.is_empty() {
        return;
    }
    tracing::debug!(workers = workers.len(), wait, "Shutting down workers");

    let results = futures::future::join_all(workers.into_iter().map(|worker| async move {
        let id = worker.id();
        (id, worker.shutdown(wait).await)
    }))
    .await;
    for (id, result) in results {
        if let Err(e) = result {
            tracing::error!(worker_id = id, error = %e, "Worker shutdown failed");
        }
    }
}
