use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::scheduler::callbacks::CallbackRef;
use crate::scheduler::job::{Job, JobId};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::stats::StatisticsSnapshot;

/// Mutable scheduler state, guarded by the scheduler's single lock.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub queue: JobQueue,
    /// Outstanding instances per job id; entries stay at 0 once done
    pub pending: HashMap<JobId, usize>,
    pub pending_job_counter: usize,
    pub callbacks: HashMap<JobId, CallbackRef>,
    pub shutdown: bool,
}

impl State {
    /// Never-ending jobs are never done; unknown ids are not done either.
    pub fn is_job_done(&self, job: &Job) -> bool {
        if job.never_ending {
            return false;
        }
        self.pending.get(&job.id).is_some_and(|count| *count == 0)
    }
}

/// Set of already visited browser states, shared by all workers of a
/// scheduler so each state is processed once pool-wide.
///
/// States are stored as SHA-256 digests to keep memory flat.
#[derive(Debug, Default)]
pub struct SkipStates {
    states: Mutex<HashSet<String>>,
}

impl SkipStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn digest(state: &str) -> String {
        let hash = Sha256::digest(state.as_bytes());
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn contains(&self, state: &str) -> bool {
        self.lock().contains(&Self::digest(state))
    }

    /// Records `state`, returns true if it had not been seen before.
    pub fn insert(&self, state: &str) -> bool {
        self.lock().insert(Self::digest(state))
    }

    /// Merges digests produced by another set.
    pub fn merge(&self, digests: impl IntoIterator<Item = String>) {
        self.lock().extend(digests);
    }

    pub fn digests(&self) -> Vec<String> {
        let mut digests: Vec<String> = self.lock().iter().cloned().collect();
        digests.sort();
        digests
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// On-disk form of a suspended scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDump {
    pub jobs: Vec<Job>,
    pub pending: Vec<(JobId, usize)>,
    pub pending_job_counter: usize,
    pub callbacks: Vec<(JobId, CallbackRef)>,
    pub skip_states: Vec<String>,
    pub statistics: StatisticsSnapshot,
}

pub(crate) const STATE_FILE: &str = "browser_pool.json";

impl StateDump {
    pub fn dump(&self, directory: &Path) -> Result<()> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(STATE_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        tracing::info!(
            path = %path.display(),
            jobs = self.jobs.len(),
            pending = self.pending_job_counter,
            "Dumped browser pool state"
        );
        Ok(())
    }

    pub fn load(directory: &Path) -> Result<Self> {
        let data = std::fs::read(directory.join(STATE_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }
}
