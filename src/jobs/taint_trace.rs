use serde::{Deserialize, Serialize};

use crate::browser::{BrowserError, Resource};
use crate::jobs::dom_exploration::{explore, ExplorationOptions};
use crate::jobs::Report;
use crate::scheduler::Job;
use crate::worker::Worker;

/// Taint to trace, and optionally the script introducing it when form
/// filling cannot reach the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintSpec {
    pub taint: String,
    pub injector: Option<String>,
}

impl TaintSpec {
    pub fn new(taint: impl Into<String>) -> Self {
        Self {
            taint: taint.into(),
            injector: None,
        }
    }

    pub fn with_injector(mut self, injector: impl Into<String>) -> Self {
        self.injector = Some(injector.into());
        self
    }
}

/// Explores a resource with a taint set, reporting every state where the
/// engine saw the taint reach a data-flow or execution-flow sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaintTrace {
    pub resource: Resource,
    pub taint: TaintSpec,
    #[serde(default)]
    pub options: ExplorationOptions,
}

impl TaintTrace {
    pub(crate) async fn run(&self, job: &Job, worker: &mut Worker) -> Result<(), BrowserError> {
        worker
            .browser()
            .set_taint(Some(&self.taint.taint), self.taint.injector.as_deref())
            .await?;
        explore(job, &self.resource, &self.options, Report::Sinks, worker).await
    }
}
