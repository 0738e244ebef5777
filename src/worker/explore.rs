//! DOM exploration primitives.
//!
//! States are deduplicated through the scheduler's [`SkipStates`], so the
//! whole pool processes each of them once:
//!
//! - an element is only triggered once per `url:tag:attributes:events`
//!   signature,
//! - a snapshot is only reported once per DOM digest and once per
//!   `url:transitions` path, which keeps pages that generate endless DOM
//!   states from running the exploration forever.
//!
//! Snapshots carrying taint sinks are always reported, seen or not.
//!
//! [`SkipStates`]: crate::scheduler::SkipStates

use crate::browser::{
    normalize_event, BrowserError, ElementLocator, EventTarget, Page, Resource, Transition,
};
use crate::scheduler::Job;
use crate::worker::Worker;

/// Snapshots captured by one or more browser operations.
#[derive(Debug, Default)]
pub struct Captures {
    /// New, unseen states
    pub pages: Vec<Page>,
    /// States on which the taint reached a sink
    pub with_sinks: Vec<Page>,
}

impl Captures {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.with_sinks.is_empty()
    }

    pub fn extend(&mut self, other: Captures) {
        self.pages.extend(other.pages);
        self.with_sinks.extend(other.with_sinks);
    }
}

/// Caps the amount of events an exploration fires.
#[derive(Debug, Clone)]
pub struct EventBudget {
    limit: Option<usize>,
    fired: usize,
}

impl EventBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, fired: 0 }
    }

    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.fired >= limit)
    }

    pub fn fired(&self) -> usize {
        self.fired
    }

    fn spend(&mut self) {
        self.fired += 1;
    }
}

/// Signature of an element within a page, used to fire its events once.
pub fn state_signature(url: &str, target: &EventTarget) -> String {
    let mut events: Vec<&str> = target.events.iter().map(String::as_str).collect();
    events.sort_unstable();
    events.dedup();

    format!(
        "{}:{}:{:?}:{:?}",
        url, target.locator.tag_name, target.locator.attributes, events
    )
}

fn transition_id(page: &Page) -> String {
    let path: Vec<String> = page.playable_transitions().map(|t| t.to_string()).collect();
    format!("{}:{}", page.url, path.join(" -> "))
}

impl Worker {
    /// Loads `resource`, replaying its transitions, optionally capturing a
    /// snapshot of the result.
    pub async fn load(
        &mut self,
        resource: &Resource,
        take_snapshot: bool,
    ) -> Result<Captures, BrowserError> {
        let transition = self.browser().load(resource).await?;

        self.transitions = if resource.transitions().is_empty() {
            vec![transition]
        } else {
            resource.transitions().to_vec()
        };

        if take_snapshot {
            return self.capture_snapshot(None).await;
        }
        Ok(Captures::default())
    }

    /// Elements on the current page whose signature no worker has processed
    /// yet. Nothing is marked here; `trigger_events` marks each element just
    /// before firing it.
    pub async fn pending_events(&mut self, url: &str) -> Result<Vec<EventTarget>, BrowserError> {
        let targets = self.browser().elements_with_events().await?;

        let skip_states = self.master().skip_states();
        Ok(targets
            .into_iter()
            .filter(|target| !skip_states.contains(&state_signature(url, target)))
            .collect())
    }

    /// Loads `resource` and fires every pending event on it, restoring the
    /// state after each one. Events are distributed to other workers when
    /// `distribute` is set and a slot is free.
    pub async fn trigger_events(
        &mut self,
        job: &Job,
        resource: &Resource,
        budget: &mut EventBudget,
        distribute: bool,
    ) -> Result<Captures, BrowserError> {
        self.load(resource, false).await?;

        let mut captures = Captures::default();
        for target in self.pending_events(resource.url()).await? {
            if budget.exhausted() {
                tracing::debug!(url = resource.url(), fired = budget.fired(), "DOM event limit reached");
                return Ok(captures);
            }
            // Another worker may have claimed it since it was listed.
            if !self
                .master()
                .skip_states()
                .insert(&state_signature(resource.url(), &target))
            {
                continue;
            }

            for event in &target.events {
                if budget.exhausted() {
                    tracing::debug!(url = resource.url(), fired = budget.fired(), "DOM event limit reached");
                    return Ok(captures);
                }
                budget.spend();

                if distribute
                    && self.distribute_event(
                        job,
                        resource.clone(),
                        target.locator.clone(),
                        event.clone(),
                    )
                {
                    continue;
                }

                captures.extend(
                    self.trigger_event(resource, &target.locator, event, true)
                        .await?,
                );
            }
        }

        Ok(captures)
    }

    /// Fires `event` on `element` and captures the resulting state. With
    /// `restore`, `resource` is reloaded afterwards.
    pub async fn trigger_event(
        &mut self,
        resource: &Resource,
        element: &ElementLocator,
        event: &str,
        restore: bool,
    ) -> Result<Captures, BrowserError> {
        let event = normalize_event(event);

        let captures = match self.browser().fire_event(element, &event).await? {
            Some(transition) => self.capture_snapshot(Some(transition)).await?,
            None => {
                tracing::debug!(element = %element, event = %event, "Could not trigger event");
                Captures::default()
            }
        };

        if restore {
            self.load(resource, false).await?;
        }
        Ok(captures)
    }

    /// Snapshots the current window, after `transition` if one just happened.
    pub async fn capture_snapshot(
        &mut self,
        transition: Option<Transition>,
    ) -> Result<Captures, BrowserError> {
        if let Some(transition) = transition {
            self.transitions.push(transition);
        }

        let mut captures = Captures::default();
        let Some(mut page) = self.browser().snapshot().await? else {
            return Ok(captures);
        };
        page.transitions = self.transitions.clone();

        let skip_states = self.master().skip_states();
        let already_seen = !skip_states.insert(&page.digest);

        if page.has_sinks() {
            captures.with_sinks.push(page.clone());
        }
        if already_seen {
            return Ok(captures);
        }

        if !skip_states.insert(&transition_id(&page)) {
            return Ok(captures);
        }

        captures.pages.push(page);
        Ok(captures)
    }
}
