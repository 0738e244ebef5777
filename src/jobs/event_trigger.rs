use serde::{Deserialize, Serialize};

use crate::browser::{BrowserError, ElementLocator, Resource};
use crate::jobs::taint_trace::TaintSpec;
use crate::jobs::{report, Report};
use crate::scheduler::Job;
use crate::worker::Worker;

/// Fires a single event on a single element of a resource.
///
/// Queued by explorations and taint traces that distribute their events;
/// carries the taint of the latter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub resource: Resource,
    pub element: ElementLocator,
    pub event: String,
    pub taint: Option<TaintSpec>,
}

impl EventTrigger {
    pub(crate) async fn run(&self, job: &Job, worker: &mut Worker) -> Result<(), BrowserError> {
        if let Some(taint) = &self.taint {
            worker
                .browser()
                .set_taint(Some(&taint.taint), taint.injector.as_deref())
                .await?;
        }

        worker.load(&self.resource, false).await?;
        let captures = worker
            .trigger_event(&self.resource, &self.element, &self.event, false)
            .await?;

        let mode = match self.taint {
            Some(_) => Report::Sinks,
            None => Report::Pages,
        };
        report(worker, job, captures, mode).await;
        Ok(())
    }
}
