use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{PoolError, Result};
use crate::scheduler::job::{Job, JobId};

/// Picks the category the scheduler should favour next, if any.
pub type Preference = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug)]
enum Slot {
    Buffered(Box<Job>),
    OnDisk { id: JobId, path: PathBuf },
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    slot: Slot,
}

#[derive(Debug, Default)]
struct Lane {
    entries: VecDeque<Entry>,
    buffered: usize,
}

/// Pending jobs, grouped by category.
///
/// Jobs come out in insertion order unless the preference function names a
/// non-empty category, in which case that category's oldest job goes first.
/// Once a category holds `max_buffer_size` jobs in memory, further jobs of
/// that category are written to the spill directory (when configured).
pub struct JobQueue {
    config: QueueConfig,
    lanes: BTreeMap<String, Lane>,
    preference: Option<Preference>,
    next_seq: u64,
    len: usize,
    /// Keeps spill files of queues sharing a directory apart
    token: String,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len)
            .field("categories", &self.lanes.len())
            .field("spill_directory", &self.config.spill_directory)
            .finish()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            lanes: BTreeMap::new(),
            preference: None,
            next_seq: 0,
            len: 0,
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Rebuilds a queue holding `jobs` in order.
    pub fn from_jobs(config: QueueConfig, jobs: Vec<Job>) -> Result<Self> {
        let mut queue = Self::new(config);
        for job in jobs {
            queue.push(job)?;
        }
        Ok(queue)
    }

    pub fn set_preference(&mut self, preference: Option<Preference>) {
        self.preference = preference;
    }

    pub fn push(&mut self, job: Job) -> Result<()> {
        let seq = self.next_seq;
        let max_buffer_size = self.config.max_buffer_size;
        let lane = self.lanes.entry(job.category().to_string()).or_default();

        let slot = match &self.config.spill_directory {
            Some(directory) if lane.buffered >= max_buffer_size => {
                fs::create_dir_all(directory)?;
                let path = directory.join(format!("{}-{}.job.json", self.token, seq));
                fs::write(&path, serde_json::to_vec(&job)?)?;
                tracing::debug!(job_id = %job.id, path = %path.display(), "Spilled job to disk");
                Slot::OnDisk { id: job.id, path }
            }
            _ => {
                lane.buffered += 1;
                Slot::Buffered(Box::new(job))
            }
        };

        lane.entries.push_back(Entry { seq, slot });
        self.next_seq += 1;
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the next job. A spilled job that cannot be read
    /// back is dropped and reported as [`PoolError::LostJob`].
    pub fn pop(&mut self) -> Result<Option<Job>> {
        let Some(category) = self.next_category() else {
            return Ok(None);
        };
        let Some(lane) = self.lanes.get_mut(&category) else {
            return Ok(None);
        };
        let Some(entry) = lane.entries.pop_front() else {
            return Ok(None);
        };
        self.len -= 1;

        let job = match entry.slot {
            Slot::Buffered(job) => {
                lane.buffered -= 1;
                *job
            }
            Slot::OnDisk { id, path } => {
                let job = read_job(&path);
                remove_file(&path);
                match job {
                    Ok(job) => job,
                    Err(e) => {
                        if lane.entries.is_empty() {
                            self.lanes.remove(&category);
                        }
                        return Err(PoolError::LostJob {
                            id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        };

        if lane.entries.is_empty() {
            self.lanes.remove(&category);
        }
        Ok(Some(job))
    }

    fn next_category(&self) -> Option<String> {
        if let Some(preferred) = self.preference.as_ref().and_then(|prefer| prefer()) {
            if self
                .lanes
                .get(&preferred)
                .is_some_and(|lane| !lane.entries.is_empty())
            {
                return Some(preferred);
            }
        }

        self.lanes
            .iter()
            .filter_map(|(category, lane)| lane.entries.front().map(|e| (e.seq, category)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, category)| category.clone())
    }

    /// Jobs in insertion order, without removing them.
    pub fn snapshot(&self) -> Result<Vec<Job>> {
        let mut entries: Vec<&Entry> = self
            .lanes
            .values()
            .flat_map(|lane| lane.entries.iter())
            .collect();
        entries.sort_by_key(|e| e.seq);

        entries
            .into_iter()
            .map(|entry| match &entry.slot {
                Slot::Buffered(job) => Ok(job.as_ref().clone()),
                Slot::OnDisk { path, .. } => read_job(path),
            })
            .collect()
    }

    /// Drops every job, including the ones spilled to disk.
    pub fn clear(&mut self) {
        for lane in self.lanes.values() {
            for entry in &lane.entries {
                if let Slot::OnDisk { path, .. } = &entry.slot {
                    remove_file(path);
                }
            }
        }
        self.lanes.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Amount of jobs currently written to disk.
    pub fn spilled(&self) -> usize {
        self.len
            - self
                .lanes
                .values()
                .map(|lane| lane.buffered)
                .sum::<usize>()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

fn read_job(path: &Path) -> Result<Job> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove spilled job");
        }
    }
}
