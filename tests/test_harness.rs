//! Test harness for browser pool integration tests.
//!
//! Provides an in-memory site driven by a fake browser, callbacks that
//! record what they receive, and helpers to start pools whose engines are
//! plain `sleep` processes.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use uuid::Uuid;

use browser_pool::browser::{
    Browser, BrowserConnector, BrowserError, DataFlowSink, ElementLocator, EventTarget, Page,
    Resource, Transition,
};
use browser_pool::config::{EngineConfig, PoolConfig};
use browser_pool::jobs::{DomExploration, ExplorationOptions, TaintSpec, TaintTrace};
use browser_pool::scheduler::{
    BrowserPool, CallbackRef, CallbackRegistry, Delivery, Job, JobKind, JobResult, PoolContext,
};
use browser_pool::worker::{EngineEndpoint, EngineKind, Worker};

// =============================================================================
// Fake site
// =============================================================================

/// An element and the state each of its events leads to.
#[derive(Debug, Clone)]
pub struct FakeElement {
    pub locator: ElementLocator,
    pub events: Vec<(String, String)>,
}

/// One DOM state of the fake site.
#[derive(Debug, Clone)]
pub struct FakeState {
    pub url: String,
    pub digest: String,
    pub elements: Vec<FakeElement>,
    pub sink: bool,
}

/// A graph of DOM states, keyed by name. Loadable states are keyed by URL.
#[derive(Debug, Default)]
pub struct FakeSite {
    states: HashMap<String, FakeState>,
    pub loads: AtomicUsize,
    pub fired: AtomicUsize,
    pub connections: AtomicUsize,
    crash_loads: AtomicUsize,
    load_delay: Mutex<Option<Duration>>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loadable page.
    pub fn page(mut self, url: &str, digest: &str) -> Self {
        self.states.insert(url.to_string(), FakeState::new(url, digest));
        self
    }

    /// Adds a state reachable through events on `url`.
    pub fn state(mut self, name: &str, url: &str, digest: &str) -> Self {
        self.states.insert(name.to_string(), FakeState::new(url, digest));
        self
    }

    /// Adds an element to `state` whose `event` leads to `target`.
    pub fn link(mut self, state: &str, id: &str, event: &str, target: &str) -> Self {
        let state = self.states.get_mut(state).expect("state should exist");
        let locator = ElementLocator::new("a", [("id", id)]);

        match state.elements.iter_mut().find(|e| e.locator == locator) {
            Some(element) => element.events.push((event.to_string(), target.to_string())),
            None => state.elements.push(FakeElement {
                locator,
                events: vec![(event.to_string(), target.to_string())],
            }),
        }
        self
    }

    /// Marks `state` as one where a taint reaches a sink.
    pub fn sink(mut self, state: &str) -> Self {
        self.states.get_mut(state).expect("state should exist").sink = true;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Makes the next `n` loads fail as if the engine crashed.
    pub fn crash_next_loads(&self, n: usize) {
        self.crash_loads.store(n, Ordering::SeqCst);
    }

    /// Makes every load take `delay`.
    pub fn delay_loads(&self, delay: Option<Duration>) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn get(&self, name: &str) -> Option<&FakeState> {
        self.states.get(name)
    }
}

impl FakeState {
    fn new(url: &str, digest: &str) -> Self {
        Self {
            url: url.to_string(),
            digest: digest.to_string(),
            elements: Vec::new(),
            sink: false,
        }
    }
}

/// Root page with two links; the first leads to a state with a deeper link
/// whose target carries a sink.
///
/// ```text
/// http://test/ --click #first--> first --click #deeper--> deep (sink)
///              --click #second--> second
///              --mouseover #second--> second
/// ```
pub fn demo_site() -> Arc<FakeSite> {
    FakeSite::new()
        .page("http://test/", "root")
        .state("first", "http://test/", "first")
        .state("second", "http://test/", "second")
        .state("deep", "http://test/", "deep")
        .link("http://test/", "first", "click", "first")
        .link("http://test/", "second", "click", "second")
        .link("http://test/", "second", "mouseover", "second")
        .link("first", "deeper", "click", "deep")
        .sink("deep")
        .build()
}

// =============================================================================
// Fake browser
// =============================================================================

pub struct FakeBrowser {
    site: Arc<FakeSite>,
    current: Option<String>,
    taint: Option<String>,
}

impl FakeBrowser {
    fn current(&self) -> Result<&FakeState, BrowserError> {
        self.current
            .as_deref()
            .and_then(|name| self.site.get(name))
            .ok_or_else(|| BrowserError::Other("nothing loaded".into()))
    }

    fn fire(&mut self, element: &ElementLocator, event: &str) -> Option<Transition> {
        let target = self
            .current()
            .ok()?
            .elements
            .iter()
            .find(|e| &e.locator == element)?
            .events
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, target)| target.clone())?;

        self.current = Some(target);
        Some(Transition::Event {
            element: element.clone(),
            event: event.to_string(),
        })
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn load(&mut self, resource: &Resource) -> Result<Transition, BrowserError> {
        self.site.loads.fetch_add(1, Ordering::SeqCst);

        let crashed = self
            .site
            .crash_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crashed {
            return Err(BrowserError::Crashed("engine went away".into()));
        }

        let delay = *self.site.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let url = resource.url().to_string();
        if self.site.get(&url).is_none() {
            return Err(BrowserError::Other(format!("no such page: {}", url)));
        }
        self.current = Some(url.clone());

        for transition in resource.transitions() {
            if let Transition::Event { element, event } = transition {
                self.fire(element, event);
            }
        }
        Ok(Transition::Load { url })
    }

    async fn elements_with_events(&mut self) -> Result<Vec<EventTarget>, BrowserError> {
        Ok(self
            .current()?
            .elements
            .iter()
            .map(|e| EventTarget {
                locator: e.locator.clone(),
                events: e.events.iter().map(|(name, _)| name.clone()).collect(),
            })
            .collect())
    }

    async fn fire_event(
        &mut self,
        element: &ElementLocator,
        event: &str,
    ) -> Result<Option<Transition>, BrowserError> {
        self.site.fired.fetch_add(1, Ordering::SeqCst);
        Ok(self.fire(element, event))
    }

    async fn snapshot(&mut self) -> Result<Option<Page>, BrowserError> {
        let Ok(state) = self.current() else {
            return Ok(None);
        };

        let mut page = Page::new(state.url.clone(), state.digest.clone());
        page.body = Some(format!("<html>{}</html>", state.digest));
        if let (true, Some(taint)) = (state.sink, &self.taint) {
            page.data_flow_sinks.push(DataFlowSink {
                function: "eval".into(),
                tainted_value: taint.clone(),
                stack: vec!["http://test/app.js:12".into()],
            });
        }
        Ok(Some(page))
    }

    async fn set_taint(
        &mut self,
        taint: Option<&str>,
        _injector: Option<&str>,
    ) -> Result<(), BrowserError> {
        self.taint = taint.map(String::from);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), BrowserError> {
        self.current = None;
        self.taint = None;
        Ok(())
    }
}

pub struct FakeConnector {
    pub site: Arc<FakeSite>,
}

#[async_trait]
impl BrowserConnector for FakeConnector {
    async fn connect(
        &self,
        _endpoint: &EngineEndpoint,
        _config: &EngineConfig,
    ) -> Result<Box<dyn Browser>, BrowserError> {
        self.site.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBrowser {
            site: self.site.clone(),
            current: None,
            taint: None,
        }))
    }
}

// =============================================================================
// Recording callbacks
// =============================================================================

fn results_store() -> &'static Mutex<HashMap<String, Vec<JobResult>>> {
    static STORE: OnceLock<Mutex<HashMap<String, Vec<JobResult>>>> = OnceLock::new();
    STORE.get_or_init(Default::default)
}

fn leases_store() -> &'static Mutex<HashMap<String, Vec<usize>>> {
    static STORE: OnceLock<Mutex<HashMap<String, Vec<usize>>>> = OnceLock::new();
    STORE.get_or_init(Default::default)
}

/// A fresh key for the recording callbacks. Jobs pass it as their first arg.
pub fn collector() -> String {
    Uuid::new_v4().to_string()
}

pub fn collector_args(collector: &str) -> Vec<Value> {
    vec![json!(collector)]
}

/// Results recorded under `collector`.
pub fn results(collector: &str) -> Vec<JobResult> {
    results_store()
        .lock()
        .unwrap()
        .get(collector)
        .cloned()
        .unwrap_or_default()
}

/// Digests of the pages recorded under `collector`, sorted.
pub fn digests(collector: &str) -> Vec<String> {
    let mut digests: Vec<String> = results(collector)
        .into_iter()
        .filter_map(|r| r.page.map(|p| p.digest))
        .collect();
    digests.sort();
    digests
}

/// Ids of the workers leased under `collector`, in lease order.
pub fn leases(collector: &str) -> Vec<usize> {
    leases_store()
        .lock()
        .unwrap()
        .get(collector)
        .cloned()
        .unwrap_or_default()
}

fn collector_of(args: &[Value]) -> String {
    args.first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn millis_arg(args: &[Value]) -> Duration {
    Duration::from_millis(args.get(1).and_then(Value::as_u64).unwrap_or(0))
}

fn record_result(delivery: &Delivery) {
    results_store()
        .lock()
        .unwrap()
        .entry(collector_of(&delivery.args))
        .or_default()
        .push(delivery.result.clone());
}

fn record_lease(worker: &Worker, args: &[Value]) {
    leases_store()
        .lock()
        .unwrap()
        .entry(collector_of(args))
        .or_default()
        .push(worker.id());
}

fn collect(delivery: Delivery) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        record_result(&delivery);
        Ok(())
    }
    .boxed()
}

fn collect_slowly(delivery: Delivery) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        tokio::time::sleep(millis_arg(&delivery.args)).await;
        record_result(&delivery);
        Ok(())
    }
    .boxed()
}

fn fail(delivery: Delivery) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        record_result(&delivery);
        anyhow::bail!("consumer rejected {}", delivery.result.job.id)
    }
    .boxed()
}

fn explode(delivery: Delivery) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        record_result(&delivery);
        if !delivery.args.is_empty() {
            panic!("consumer blew up");
        }
        Ok(())
    }
    .boxed()
}

fn lease(worker: &mut Worker, args: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        record_lease(worker, &args);
        Ok(())
    }
    .boxed()
}

fn hold(worker: &mut Worker, args: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        tokio::time::sleep(millis_arg(&args)).await;
        record_lease(worker, &args);
        Ok(())
    }
    .boxed()
}

fn crash(worker: &mut Worker, args: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        record_lease(worker, &args);
        Err(anyhow::Error::new(BrowserError::Crashed(
            "lost the session".into(),
        )))
    }
    .boxed()
}

fn misbehave(worker: &mut Worker, args: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        record_lease(worker, &args);
        anyhow::bail!("lease consumer failed")
    }
    .boxed()
}

/// Loads the URL in `args[1]` through the leased worker.
fn snapshot_url(worker: &mut Worker, args: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        record_lease(worker, &args);
        let url = args.get(1).and_then(Value::as_str).unwrap_or_default();
        let resource = Resource::from(url);
        worker.load(&resource, false).await?;
        let page = worker.browser().snapshot().await?;
        anyhow::ensure!(page.is_some(), "nothing to snapshot");
        Ok(())
    }
    .boxed()
}

pub fn collect_cb() -> CallbackRef {
    CallbackRef::new("Collector", "collect")
}

pub fn collect_slowly_cb() -> CallbackRef {
    CallbackRef::new("Collector", "collect_slowly")
}

pub fn fail_cb() -> CallbackRef {
    CallbackRef::new("Collector", "fail")
}

pub fn explode_cb() -> CallbackRef {
    CallbackRef::new("Collector", "explode")
}

pub fn lease_cb() -> CallbackRef {
    CallbackRef::new("Lease", "record")
}

pub fn hold_cb() -> CallbackRef {
    CallbackRef::new("Lease", "hold")
}

pub fn crash_cb() -> CallbackRef {
    CallbackRef::new("Lease", "crash")
}

pub fn misbehave_cb() -> CallbackRef {
    CallbackRef::new("Lease", "misbehave")
}

pub fn snapshot_url_cb() -> CallbackRef {
    CallbackRef::new("Lease", "snapshot_url")
}

pub fn registry() -> CallbackRegistry {
    let mut registry = CallbackRegistry::new();
    registry.register_result("Collector", "collect", collect);
    registry.register_result("Collector", "collect_slowly", collect_slowly);
    registry.register_result("Collector", "fail", fail);
    registry.register_result("Collector", "explode", explode);
    registry.register_browser("Lease", "record", lease);
    registry.register_browser("Lease", "hold", hold);
    registry.register_browser("Lease", "crash", crash);
    registry.register_browser("Lease", "misbehave", misbehave);
    registry.register_browser("Lease", "snapshot_url", snapshot_url);
    registry
}

pub fn test_context() -> Arc<PoolContext> {
    PoolContext::new(registry())
}

// =============================================================================
// Pools
// =============================================================================

/// Pool configuration with `sleep` standing in for the browser engine and
/// short deadlines for faster tests.
pub fn test_config(size: usize) -> PoolConfig {
    let mut engine = EngineConfig::new(EngineKind::Chrome).with_command(["sleep", "30"]);
    engine.spawn_attempts = 1;
    engine.wait_for_port = false;

    let mut config = PoolConfig::new(size).with_engine(engine);
    config.job_timeout = Duration::from_secs(5);
    config.job_retries = 2;
    config
}

pub fn connector(site: &Arc<FakeSite>) -> Arc<dyn BrowserConnector> {
    Arc::new(FakeConnector { site: site.clone() })
}

pub async fn start_pool(config: PoolConfig, site: &Arc<FakeSite>) -> BrowserPool {
    BrowserPool::bounded(config, test_context(), connector(site))
        .await
        .expect("pool should start")
}

pub async fn start_cluster(config: PoolConfig, site: &Arc<FakeSite>) -> BrowserPool {
    BrowserPool::cluster(config, test_context(), connector(site))
        .await
        .expect("cluster should start")
}

/// Waits for the pool to drain, failing the test after `timeout`.
pub async fn wait_with_timeout(pool: &BrowserPool, timeout: Duration) {
    tokio::time::timeout(timeout, pool.wait())
        .await
        .expect("pool should drain in time")
        .expect("pool should not be shut down");
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

// =============================================================================
// Jobs
// =============================================================================

pub const ROOT: &str = "http://test/";

/// An exploration of [`ROOT`] reporting to `collector`.
pub fn exploration_job(collector: &str, options: ExplorationOptions) -> Job {
    Job::new(JobKind::DomExploration(DomExploration {
        resource: Resource::from(ROOT),
        options,
    }))
    .with_args(collector_args(collector))
}

/// A taint trace of [`ROOT`] reporting to `collector`.
pub fn taint_trace_job(collector: &str, taint: &str, options: ExplorationOptions) -> Job {
    Job::new(JobKind::TaintTrace(TaintTrace {
        resource: Resource::from(ROOT),
        taint: TaintSpec::new(taint),
        options,
    }))
    .with_args(collector_args(collector))
}

/// A browser lease that holds the worker for `millis`.
pub fn hold_job(collector: &str, millis: u64) -> Job {
    Job::browser_provider(vec![json!(collector), json!(millis)])
}
