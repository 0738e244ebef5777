//! Contract with the browser automation layer.
//!
//! The pool never drives a browser engine directly. Each worker owns an engine
//! process and talks to it through a [`Browser`] session obtained from a
//! [`BrowserConnector`]. Navigation, event dispatch, DOM digests and taint
//! instrumentation all live on the other side of this boundary.
//!
//! The data types here ([`Resource`], [`Page`], [`Transition`],
//! [`ElementLocator`]) are serializable because jobs carrying them may be
//! spilled to disk and resumed in another process.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::worker::engine::EngineEndpoint;

/// Errors reported by the automation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    /// The engine died or stopped answering; the worker reboots it before retrying.
    #[error("engine crashed: {0}")]
    Crashed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

/// Identifies an element by its tag and attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementLocator {
    pub tag_name: String,
    pub attributes: BTreeMap<String, String>,
}

impl ElementLocator {
    pub fn new<I, K, V>(tag_name: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tag_name: tag_name.into(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// CSS selector matching this element.
    pub fn css(&self) -> String {
        let mut css = self.tag_name.clone();
        for (name, value) in &self.attributes {
            css.push_str(&format!("[{}=\"{}\"]", name, value.replace('"', "\\\"")));
        }
        css
    }
}

impl fmt::Display for ElementLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag_name)?;
        for (name, value) in &self.attributes {
            write!(f, " {}=\"{}\"", name, value)?;
        }
        write!(f, ">")
    }
}

/// Normalizes an event name: lowercase, without the `on` prefix.
pub fn normalize_event(event: &str) -> String {
    let event = event.trim().to_ascii_lowercase();
    match event.strip_prefix("on") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => event,
    }
}

/// A DOM state change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// A page load
    Load { url: String },
    /// An event fired on an element
    Event {
        element: ElementLocator,
        event: String,
    },
    /// A request performed by the page, e.g. AJAX
    Request { url: String },
}

impl Transition {
    /// Whether replaying this transition reproduces the DOM state.
    pub fn is_playable(&self) -> bool {
        !matches!(self, Transition::Request { .. })
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Load { url } => write!(f, "[load] {}", url),
            Transition::Event { element, event } => write!(f, "[{}] {}", event, element),
            Transition::Request { url } => write!(f, "[request] {}", url),
        }
    }
}

/// Something a job operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    /// URL to load
    Url(String),
    /// A DOM state, reached by loading `url` and replaying `transitions`
    Dom {
        url: String,
        transitions: Vec<Transition>,
    },
    /// An HTTP response to load as-is
    Response {
        url: String,
        status: u16,
        body: String,
    },
}

impl Resource {
    pub fn url(&self) -> &str {
        match self {
            Resource::Url(url) => url,
            Resource::Dom { url, .. } => url,
            Resource::Response { url, .. } => url,
        }
    }

    /// Transitions the engine must replay after loading the URL.
    pub fn transitions(&self) -> &[Transition] {
        match self {
            Resource::Dom { transitions, .. } => transitions,
            _ => &[],
        }
    }

    /// Lightweight copy that only remembers where the resource lives.
    pub fn to_url(&self) -> Resource {
        Resource::Url(self.url().to_string())
    }
}

impl From<&str> for Resource {
    fn from(url: &str) -> Self {
        Resource::Url(url.to_string())
    }
}

impl From<String> for Resource {
    fn from(url: String) -> Self {
        Resource::Url(url)
    }
}

/// Pages are heavy, a resource only keeps their DOM state.
impl From<&Page> for Resource {
    fn from(page: &Page) -> Self {
        Resource::Dom {
            url: page.url.clone(),
            transitions: page
                .transitions
                .iter()
                .filter(|t| t.is_playable())
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Url(url) => write!(f, "{}", url),
            Resource::Dom { url, transitions } => {
                write!(f, "{} ({} transitions)", url, transitions.len())
            }
            Resource::Response { url, status, .. } => write!(f, "{} [{}]", url, status),
        }
    }
}

/// A point where the taint reached a JS function argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlowSink {
    pub function: String,
    pub tainted_value: String,
    pub stack: Vec<String>,
}

/// A point where injected code got executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFlowSink {
    pub stack: Vec<String>,
}

/// Snapshot of a browser window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub url: String,
    /// Content digest of the DOM as computed by the engine
    pub digest: String,
    /// Transitions that led to this state, starting with its load
    pub transitions: Vec<Transition>,
    pub body: Option<String>,
    pub data_flow_sinks: Vec<DataFlowSink>,
    pub execution_flow_sinks: Vec<ExecutionFlowSink>,
    pub captured_at: DateTime<Utc>,
}

impl Page {
    pub fn new(url: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            digest: digest.into(),
            transitions: Vec::new(),
            body: None,
            data_flow_sinks: Vec::new(),
            execution_flow_sinks: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn has_sinks(&self) -> bool {
        !self.data_flow_sinks.is_empty() || !self.execution_flow_sinks.is_empty()
    }

    pub fn playable_transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(|t| t.is_playable())
    }
}

/// An element along with the events it handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTarget {
    pub locator: ElementLocator,
    pub events: Vec<String>,
}

/// A live automation session against one engine process.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Loads `resource`, replaying any transitions it carries, and returns the
    /// load transition.
    async fn load(&mut self, resource: &Resource) -> Result<Transition, BrowserError>;

    /// Visible elements of the current page which have events, in document order.
    /// Elements whose targets fall out of scope are already filtered.
    async fn elements_with_events(&mut self) -> Result<Vec<EventTarget>, BrowserError>;

    /// Fires `event` on `element`. Returns `None` if the element could not be located.
    async fn fire_event(
        &mut self,
        element: &ElementLocator,
        event: &str,
    ) -> Result<Option<Transition>, BrowserError>;

    /// Captures the current window, `None` if there is no response to snapshot.
    /// The returned page's transitions are filled in by the worker.
    async fn snapshot(&mut self) -> Result<Option<Page>, BrowserError>;

    /// Sets the taint to trace and the optional script that introduces it.
    async fn set_taint(
        &mut self,
        taint: Option<&str>,
        injector: Option<&str>,
    ) -> Result<(), BrowserError>;

    /// Clears per-job state (buffers, taint, custom code).
    async fn reset(&mut self) -> Result<(), BrowserError>;
}

/// Opens automation sessions against freshly spawned engine processes.
#[async_trait]
pub trait BrowserConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &EngineEndpoint,
        config: &EngineConfig,
    ) -> Result<Box<dyn Browser>, BrowserError>;
}
