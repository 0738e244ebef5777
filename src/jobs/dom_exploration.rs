use serde::{Deserialize, Serialize};

use crate::browser::{BrowserError, Resource};
use crate::jobs::{report, Report};
use crate::scheduler::Job;
use crate::worker::{EventBudget, Worker};

/// Per-job exploration settings. Unset ceilings fall back to the pool's
/// [`ExplorationLimits`](crate::config::ExplorationLimits).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationOptions {
    pub depth: Option<usize>,
    pub dom_event_limit: Option<usize>,
    /// Fire events as separate jobs on other workers when slots are free.
    /// A distributed event only reports the state it leads to; that branch
    /// is not explored any further.
    #[serde(default)]
    pub distribute_events: bool,
}

impl ExplorationOptions {
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_dom_event_limit(mut self, limit: usize) -> Self {
        self.dom_event_limit = Some(limit);
        self
    }

    pub fn distribute_events(mut self, distribute: bool) -> Self {
        self.distribute_events = distribute;
        self
    }
}

/// Loads a resource and explores the DOM states reachable through its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomExploration {
    pub resource: Resource,
    #[serde(default)]
    pub options: ExplorationOptions,
}

impl DomExploration {
    pub(crate) async fn run(&self, job: &Job, worker: &mut Worker) -> Result<(), BrowserError> {
        explore(job, &self.resource, &self.options, Report::Pages, worker).await
    }
}

/// Breadth-first exploration shared by exploration and taint traces.
///
/// Layer 0 is the loaded resource. Every following layer fires the pending
/// events of the states discovered by the previous one, until a layer turns
/// up nothing new or a ceiling is hit.
pub(crate) async fn explore(
    job: &Job,
    resource: &Resource,
    options: &ExplorationOptions,
    mode: Report,
    worker: &mut Worker,
) -> Result<(), BrowserError> {
    let limits = worker.master().config().exploration;
    let depth = options.depth.or(limits.depth);
    let mut budget = EventBudget::new(options.dom_event_limit.or(limits.dom_event_limit));

    let captures = worker.load(resource, true).await?;
    report(worker, job, captures, mode).await;

    let mut frontier = vec![resource.clone()];
    let mut layer = 0;

    while !frontier.is_empty() {
        if depth.is_some_and(|depth| layer >= depth) {
            tracing::debug!(job_id = %job.id, layer, "Exploration depth reached");
            break;
        }
        if budget.exhausted() {
            break;
        }

        let mut next = Vec::new();
        for state in &frontier {
            let captures = worker
                .trigger_events(job, state, &mut budget, options.distribute_events)
                .await?;
            next.extend(
                report(worker, job, captures, mode)
                    .await
                    .iter()
                    .map(Resource::from),
            );
        }

        tracing::debug!(job_id = %job.id, layer, new_states = next.len(), "Explored layer");
        frontier = next;
        layer += 1;
    }

    Ok(())
}
