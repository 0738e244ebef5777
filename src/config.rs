use std::path::PathBuf;
use std::time::Duration;

use crate::worker::engine::EngineKind;

/// Default amount of workers in a pool.
pub const POOL_SIZE: usize = 1;

/// Default amount of jobs the bounded pool admits at once (queued + running).
pub const JOB_QUEUE_SIZE: usize = 50;

/// Placeholder substituted with the chosen port in engine command lines.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Configuration for the browser-engine process owned by each worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Which browser engine to drive
    pub kind: EngineKind,
    /// Full command line overriding the engine's default driver invocation.
    /// Any `{port}` token is replaced with the port picked for the process.
    pub command: Option<Vec<String>>,
    /// How many times to try spawning before giving up
    pub spawn_attempts: usize,
    /// How long to wait for the engine to start accepting connections
    pub spawn_timeout: Duration,
    /// Poll the engine's port until it accepts connections.
    /// When false the process only has to survive a short startup grace period.
    pub wait_for_port: bool,
    /// Browser window width
    pub width: u32,
    /// Browser window height
    pub height: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Chrome,
            command: None,
            spawn_attempts: 10,
            spawn_timeout: Duration::from_secs(10),
            wait_for_port: true,
            width: 1600,
            height: 1200,
        }
    }
}

impl EngineConfig {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Use a custom command line instead of the engine's driver.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Command line used to start an engine listening on `port`.
    pub fn command_for(&self, port: u16) -> Vec<String> {
        let template = match &self.command {
            Some(command) => command.clone(),
            None => self.kind.default_command(),
        };

        template
            .into_iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect()
    }
}

/// Ceilings applied to DOM exploration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExplorationLimits {
    /// How many layers of events to fire beyond the loaded page (`None` explores
    /// until no new states appear)
    pub depth: Option<usize>,
    /// Maximum amount of events fired per exploration job
    pub dom_event_limit: Option<usize>,
}

/// Configuration for the job queue backing store.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs kept in memory per category before spilling to disk
    pub max_buffer_size: usize,
    /// Directory for spilled jobs. Without one every job stays in memory.
    pub spill_directory: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 10,
            spill_directory: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Amount of workers (and therefore browser engines) in the pool
    pub size: usize,
    /// Admission capacity of the bounded pool
    pub job_queue_size: usize,
    /// Deadline for a single attempt at running a job
    pub job_timeout: Duration,
    /// Jobs a worker runs before its engine is rebooted
    pub worker_time_to_live: usize,
    /// Extra attempts after a browser error or time-out
    pub job_retries: usize,
    pub engine: EngineConfig,
    pub exploration: ExplorationLimits,
    pub queue: QueueConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: POOL_SIZE,
            job_queue_size: JOB_QUEUE_SIZE,
            job_timeout: Duration::from_secs(120),
            worker_time_to_live: 1000,
            job_retries: 6,
            engine: EngineConfig::default(),
            exploration: ExplorationLimits::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_job_queue_size(mut self, job_queue_size: usize) -> Self {
        self.job_queue_size = job_queue_size;
        self
    }

    pub fn with_spill_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.queue.spill_directory = Some(directory.into());
        self
    }
}
