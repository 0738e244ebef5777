use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::browser::{Page, Resource};
use crate::jobs::{DomExploration, EventTrigger, TaintTrace};

/// Stable job identity, shared by every forwarded copy of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// What a job does once a worker runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Leases the worker to a browser callback, nothing is loaded.
    BrowserProvider,
    DomExploration(DomExploration),
    TaintTrace(TaintTrace),
    EventTrigger(EventTrigger),
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::BrowserProvider => "browser_provider",
            JobKind::DomExploration(_) => "dom_exploration",
            JobKind::TaintTrace(_) => "taint_trace",
            JobKind::EventTrigger(_) => "event_trigger",
        }
    }

    pub fn resource(&self) -> Option<&Resource> {
        match self {
            JobKind::BrowserProvider => None,
            JobKind::DomExploration(job) => Some(&job.resource),
            JobKind::TaintTrace(job) => Some(&job.resource),
            JobKind::EventTrigger(job) => Some(&job.resource),
        }
    }

    fn resource_mut(&mut self) -> Option<&mut Resource> {
        match self {
            JobKind::BrowserProvider => None,
            JobKind::DomExploration(job) => Some(&mut job.resource),
            JobKind::TaintTrace(job) => Some(&mut job.resource),
            JobKind::EventTrigger(job) => Some(&mut job.resource),
        }
    }
}

/// A unit of work for the pool.
///
/// Jobs are plain data: they can be spilled to disk, suspended and resumed
/// in another process. The callback that receives their results is tracked
/// by the scheduler under [`Job::id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Scheduling preference label, defaults to the kind's name
    pub category: Option<String>,
    /// Caller payload echoed back with every result
    pub args: Vec<Value>,
    /// Reusable lease: never reported done, callback never evicted
    pub never_ending: bool,
    /// The job this one was forwarded from, if any
    pub forwarder: Option<JobId>,
    /// Time the last run took
    #[serde(skip)]
    pub time: Option<Duration>,
    #[serde(skip)]
    pub timed_out: bool,
    pub created_at: DateTime<Utc>,
    pub kind: JobKind,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: JobId::new(),
            category: None,
            args: Vec::new(),
            never_ending: false,
            forwarder: None,
            time: None,
            timed_out: false,
            created_at: Utc::now(),
            kind,
        }
    }

    pub fn browser_provider(args: Vec<Value>) -> Self {
        Self::new(JobKind::BrowserProvider).with_args(args)
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn never_ending(mut self, never_ending: bool) -> Self {
        self.never_ending = never_ending;
        self
    }

    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or_else(|| self.kind.name())
    }

    pub fn resource(&self) -> Option<&Resource> {
        self.kind.resource()
    }

    /// Same job identity (and therefore callback) with a different payload.
    pub fn forward(&self, kind: JobKind) -> Job {
        Job {
            id: self.id,
            category: self.category.clone(),
            args: self.args.clone(),
            never_ending: self.never_ending,
            forwarder: self.forwarder,
            time: None,
            timed_out: false,
            created_at: Utc::now(),
            kind,
        }
    }

    /// A new job of another kind, inheriting args, category and
    /// never-ending-ness from this one.
    pub fn forward_as(&self, kind: JobKind) -> Job {
        Job {
            id: JobId::new(),
            forwarder: Some(self.id),
            ..self.forward(kind)
        }
    }

    /// Copy to attach to a result: resources are reduced to their URL.
    pub fn clean_copy(&self) -> Job {
        let mut job = self.clone();
        if let Some(resource) = job.kind.resource_mut() {
            *resource = resource.to_url();
        }
        job
    }

    pub fn timed_out(&mut self, elapsed: Duration) {
        self.timed_out = true;
        self.time = Some(elapsed);
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.id)?;
        if let Some(resource) = self.resource() {
            write!(f, " {}", resource)?;
        }
        if let JobKind::EventTrigger(trigger) = &self.kind {
            write!(f, " [{}] {}", trigger.event, trigger.element)?;
        }
        Ok(())
    }
}

/// Outcome of running a job, handed to the job's callback exactly once.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: Job,
    pub page: Option<Page>,
}

impl JobResult {
    pub fn new(job: Job, page: Option<Page>) -> Self {
        Self { job, page }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.page {
            Some(page) => write!(f, "result for {} ({})", self.job, page.url),
            None => write!(f, "result for {}", self.job),
        }
    }
}
