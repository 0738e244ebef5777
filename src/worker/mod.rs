//! Browser workers.
//!
//! A [`Worker`] owns exactly one engine process and one automation session
//! against it, and runs the jobs it pops from its scheduler one at a time.
//!
//! # Components
//!
//! - [`engine`]: engine process lifecycle (spawn, liveness, reboot, kill)
//! - [`lifeline`]: supervisor task that keeps engines from being orphaned
//! - [`explore`]: DOM exploration primitives used by the job types
//!
//! # Job flow
//!
//! 1. The consumer loop pops the next job from the scheduler
//! 2. The engine is rebooted first if it died or its time-to-live ran out
//! 3. The job runs under `job_timeout`, retried up to `job_retries` times on
//!    browser errors and time-outs
//! 4. Per-job browser state is reset and the job is reported done, whatever
//!    the outcome

pub mod engine;
pub mod explore;
pub mod lifeline;

pub use engine::{EngineEndpoint, EngineKind, EngineProcess};
pub use explore::{Captures, EventBudget};

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::{Browser, BrowserError, ElementLocator, Page, Resource, Transition};
use crate::error::{PoolError, Result};
use crate::jobs::{self, EventTrigger};
use crate::scheduler::{BrowserPool, Job, JobId, JobKind, JobResult};

/// Snapshot of a worker, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub pid: Option<u32>,
    pub lifeline_pid: u32,
    pub endpoint: String,
    pub alive: bool,
    pub job: Option<JobId>,
    pub time_to_live: usize,
    pub jobs_run: u64,
}

pub struct Worker {
    id: usize,
    master: BrowserPool,
    engine: EngineProcess,
    browser: Box<dyn Browser>,
    time_to_live: usize,
    job: Option<JobId>,
    jobs_run: u64,
    transitions: Vec<Transition>,
    status: watch::Sender<WorkerStatus>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("job", &self.job)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl Worker {
    /// Starts an engine for `master` and connects to it.
    pub async fn spawn(id: usize, master: BrowserPool) -> Result<Self> {
        let config = master.config();
        let engine = EngineProcess::spawn(&config.engine).await?;
        let browser = master
            .connector()
            .connect(engine.endpoint(), &config.engine)
            .await?;

        tracing::info!(
            worker_id = id,
            pid = ?engine.pid(),
            lifeline_pid = engine.lifeline_pid(),
            endpoint = %engine.endpoint(),
            "Spawned browser worker"
        );

        let time_to_live = config.worker_time_to_live;
        let (status, _) = watch::channel(WorkerStatus {
            id,
            pid: engine.pid(),
            lifeline_pid: engine.lifeline_pid(),
            endpoint: engine.endpoint().url.clone(),
            alive: true,
            job: None,
            time_to_live,
            jobs_run: 0,
        });

        Ok(Self {
            id,
            master,
            engine,
            browser,
            time_to_live,
            job: None,
            jobs_run: 0,
            transitions: Vec::new(),
            status,
        })
    }

    /// Runs the consumer loop on its own task.
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let status = self.status.subscribe();
        let id = self.id;
        let join = tokio::spawn(self.consume(cancel.clone()));

        WorkerHandle {
            id,
            cancel,
            join,
            status,
        }
    }

    async fn consume(mut self, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = self.master.pop() => job,
            };

            match job {
                Some(job) => self.run_job(job).await,
                None => break,
            }
        }

        tracing::debug!(worker_id = self.id, "Worker loop stopped");
        self.engine.shutdown(true).await;
        self.publish_status();
    }

    /// Runs `job` and reports it done, whatever happens.
    pub async fn run_job(&mut self, mut job: Job) {
        self.job = Some(job.id);
        self.publish_status();
        tracing::debug!(worker_id = self.id, job_id = %job.id, job = %job, "Started");

        match self.reboot_if_necessary().await {
            Ok(()) => {
                self.execute(&mut job).await;
                self.time_to_live = self.time_to_live.saturating_sub(1);
            }
            Err(e) => {
                tracing::error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    error = %e,
                    "Could not reboot the engine, will try again at the next job"
                );
                self.master.statistics().increment_failed_count();
            }
        }

        self.reset().await;
        self.jobs_run += 1;
        self.job = None;
        self.publish_status();

        tracing::debug!(worker_id = self.id, job_id = %job.id, "Finished");
        self.master.job_done(&job);
    }

    async fn execute(&mut self, job: &mut Job) {
        let timeout = self.master.config().job_timeout;
        let tries = self.master.config().job_retries;
        let mut retries = tries;

        loop {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, jobs::run(&*job, self)).await;

            match outcome {
                Ok(Ok(())) => {
                    job.time = Some(started.elapsed());
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(worker_id = self.id, job_id = %job.id, error = %e, "Job error");
                    if retries > 0 {
                        retries -= 1;
                        tracing::debug!(job_id = %job.id, "[RETRY {}/{}] Job failed", retries, tries);
                        self.recover(matches!(e, BrowserError::Crashed(_))).await;
                        continue;
                    }
                    tracing::warn!(job_id = %job.id, job = %job, error = %e, "Job failed");
                    job.time = Some(started.elapsed());
                    self.master.statistics().increment_failed_count();
                    return;
                }
                Err(_) => {
                    if retries > 0 {
                        retries -= 1;
                        tracing::debug!(job_id = %job.id, "[RETRY {}/{}] Job timed-out", retries, tries);
                        self.recover(false).await;
                        continue;
                    }
                    job.timed_out(started.elapsed());
                    tracing::warn!(job_id = %job.id, job = %job, timeout = ?timeout, "Job timed-out");
                    self.master.statistics().increment_time_out_count();
                    self.master.statistics().increment_failed_count();
                    return;
                }
            }
        }
    }

    /// Gets the browser back into a usable state before a retry.
    async fn recover(&mut self, crashed: bool) {
        if crashed || !self.engine.is_alive() {
            if let Err(e) = self.reboot().await {
                tracing::error!(worker_id = self.id, error = %e, "Engine reboot failed");
            }
            return;
        }
        self.reset().await;
    }

    async fn reboot_if_necessary(&mut self) -> Result<()> {
        if self.time_to_live > 0 && self.engine.is_alive() {
            return Ok(());
        }
        self.reboot().await
    }

    /// Replaces the engine and the session, restoring the time-to-live.
    pub async fn reboot(&mut self) -> Result<()> {
        tracing::info!(
            worker_id = self.id,
            time_to_live = self.time_to_live,
            alive = self.engine.is_alive(),
            "Rebooting engine"
        );

        let config = self.master.config();
        self.time_to_live = config.worker_time_to_live;
        self.transitions.clear();

        self.engine.reboot().await?;
        self.browser = self
            .master
            .connector()
            .connect(self.engine.endpoint(), &config.engine)
            .await?;

        self.publish_status();
        Ok(())
    }

    /// Clears per-job browser state.
    async fn reset(&mut self) {
        self.transitions.clear();
        if let Err(e) = self.browser.reset().await {
            tracing::debug!(worker_id = self.id, error = %e, "Browser reset failed");
        }
    }

    /// Hands a page produced by `job` to the job's callback.
    pub async fn save_result(&self, job: &Job, page: Option<Page>) {
        self.master
            .handle_job_result(JobResult::new(job.clean_copy(), page))
            .await;
    }

    /// Queues the firing of `event` on `element` as its own job, with the
    /// callback of `job`. Returns false when the event should be fired
    /// locally instead, e.g. when no admission slot is free.
    pub fn distribute_event(
        &self,
        job: &Job,
        resource: Resource,
        element: ElementLocator,
        event: String,
    ) -> bool {
        let Some(callback) = self.master.callback_for(job.id) else {
            return false;
        };

        let taint = match &job.kind {
            JobKind::TaintTrace(trace) => Some(trace.taint.clone()),
            JobKind::EventTrigger(trigger) => trigger.taint.clone(),
            _ => None,
        };
        let trigger = job.forward_as(JobKind::EventTrigger(EventTrigger {
            resource,
            element,
            event,
            taint,
        }));

        match self.master.try_queue(trigger, callback) {
            Ok(queued) => queued,
            Err(PoolError::AlreadyDone(_)) | Err(PoolError::AlreadyShutdown) => false,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Could not distribute event");
                false
            }
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn master(&self) -> &BrowserPool {
        &self.master
    }

    pub fn browser(&mut self) -> &mut dyn Browser {
        self.browser.as_mut()
    }

    pub fn engine(&self) -> &EngineProcess {
        &self.engine
    }

    pub fn pid(&self) -> Option<u32> {
        self.engine.pid()
    }

    pub fn lifeline_pid(&self) -> u32 {
        self.engine.lifeline_pid()
    }

    /// The job being run, if any.
    pub fn job(&self) -> Option<JobId> {
        self.job
    }

    pub fn time_to_live(&self) -> usize {
        self.time_to_live
    }

    /// Transitions that led to the current browser state.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    fn publish_status(&self) {
        self.status.send_replace(WorkerStatus {
            id: self.id,
            pid: self.engine.pid(),
            lifeline_pid: self.engine.lifeline_pid(),
            endpoint: self.engine.endpoint().url.clone(),
            alive: self.engine.is_alive(),
            job: self.job,
            time_to_live: self.time_to_live,
            jobs_run: self.jobs_run,
        });
    }
}

/// Owner-side handle of a running worker.
pub struct WorkerHandle {
    id: usize,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    status: watch::Receiver<WorkerStatus>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Stops the worker.
    ///
    /// With `wait` the in-flight job (if any) finishes and the engine is
    /// reaped before this returns. Without it the worker task is aborted and
    /// its engine killed in the background.
    pub async fn shutdown(self, wait: bool) -> Result<()> {
        tracing::debug!(worker_id = self.id, wait, "Shutting down worker");
        self.cancel.cancel();

        if !wait {
            self.join.abort();
            return Ok(());
        }

        self.join.await.map_err(|e| PoolError::Worker {
            id: self.id,
            reason: e.to_string(),
        })
    }
}
