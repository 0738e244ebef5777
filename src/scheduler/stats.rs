use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Aggregate job statistics shared by every scheduler of a [`PoolContext`].
///
/// [`PoolContext`]: crate::scheduler::PoolContext
#[derive(Debug, Default)]
pub struct Statistics {
    queued: AtomicU64,
    completed: AtomicU64,
    time_outs: AtomicU64,
    failed: AtomicU64,
    total_job_time_micros: AtomicU64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub queued_job_count: u64,
    pub completed_job_count: u64,
    pub time_out_count: u64,
    pub failed_count: u64,
    /// Seconds
    pub total_job_time: f64,
    pub seconds_per_job: f64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_queued_job_count(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed_job_count(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_time_out_count(&self) {
        self.time_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed_count(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_to_total_job_time(&self, time: Duration) {
        let micros = u64::try_from(time.as_micros()).unwrap_or(u64::MAX);
        self.total_job_time_micros
            .fetch_add(micros, Ordering::Relaxed);
    }

    pub fn queued_job_count(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn completed_job_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn time_out_count(&self) -> u64 {
        self.time_outs.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_job_time(&self) -> Duration {
        Duration::from_micros(self.total_job_time_micros.load(Ordering::Relaxed))
    }

    /// Average job time in seconds, 0 until a job completes.
    pub fn seconds_per_job(&self) -> f64 {
        let completed = self.completed_job_count();
        if completed == 0 {
            return 0.0;
        }
        self.total_job_time().as_secs_f64() / completed as f64
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            queued_job_count: self.queued_job_count(),
            completed_job_count: self.completed_job_count(),
            time_out_count: self.time_out_count(),
            failed_count: self.failed_count(),
            total_job_time: self.total_job_time().as_secs_f64(),
            seconds_per_job: self.seconds_per_job(),
        }
    }

    /// Loads counters from a snapshot, e.g. when resuming a suspended scan.
    pub fn restore(&self, snapshot: &StatisticsSnapshot) {
        self.queued
            .store(snapshot.queued_job_count, Ordering::Relaxed);
        self.completed
            .store(snapshot.completed_job_count, Ordering::Relaxed);
        self.time_outs
            .store(snapshot.time_out_count, Ordering::Relaxed);
        self.failed.store(snapshot.failed_count, Ordering::Relaxed);
        self.total_job_time_micros.store(
            Duration::from_secs_f64(snapshot.total_job_time.max(0.0)).as_micros() as u64,
            Ordering::Relaxed,
        );
    }

    pub fn reset(&self) {
        self.restore(&StatisticsSnapshot::default());
    }
}
