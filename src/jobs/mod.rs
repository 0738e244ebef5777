//! Job kinds run by the workers.
//!
//! - [`browser_provider`]: leases the worker itself to a browser callback
//! - [`dom_exploration`]: breadth-first exploration of a page's DOM states
//! - [`taint_trace`]: exploration with a taint, reporting pages with sinks
//! - [`event_trigger`]: a single event, distributed by one of the above

pub mod browser_provider;
pub mod dom_exploration;
pub mod event_trigger;
pub mod taint_trace;

pub use dom_exploration::{DomExploration, ExplorationOptions};
pub use event_trigger::EventTrigger;
pub use taint_trace::{TaintSpec, TaintTrace};

use crate::browser::{BrowserError, Page};
use crate::scheduler::{Job, JobKind};
use crate::worker::{Captures, Worker};

/// Runs one attempt of `job` on `worker`.
pub(crate) async fn run(job: &Job, worker: &mut Worker) -> Result<(), BrowserError> {
    match &job.kind {
        JobKind::BrowserProvider => browser_provider::run(job, worker).await,
        JobKind::DomExploration(exploration) => exploration.run(job, worker).await,
        JobKind::TaintTrace(trace) => trace.run(job, worker).await,
        JobKind::EventTrigger(trigger) => trigger.run(job, worker).await,
    }
}

/// Which captured pages a job reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Report {
    /// Every new state
    Pages,
    /// Every state where the taint reached a sink
    Sinks,
}

/// Saves the pages `mode` selects and returns the new states.
pub(crate) async fn report(
    worker: &Worker,
    job: &Job,
    captures: Captures,
    mode: Report,
) -> Vec<Page> {
    let reported = match mode {
        Report::Pages => &captures.pages,
        Report::Sinks => &captures.with_sinks,
    };
    for page in reported {
        worker.save_result(job, Some(page.clone())).await;
    }
    captures.pages
}
