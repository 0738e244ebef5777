//! Browser-engine processes.
//!
//! Every worker owns one engine: a WebDriver-speaking process (chromedriver,
//! geckodriver or a custom command) listening on a port picked at spawn
//! time. The process is guarded by a [`Lifeline`] and, on Linux, is also
//! killed by the kernel if this process dies.

use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::config::EngineConfig;
use crate::error::{PoolError, Result};
use crate::worker::lifeline::Lifeline;

/// How long a process must stay up when its port is not polled.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Chrome,
    Firefox,
}

impl EngineKind {
    pub const SUPPORTED: [EngineKind; 2] = [EngineKind::Chrome, EngineKind::Firefox];

    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Chrome => "chrome",
            EngineKind::Firefox => "firefox",
        }
    }

    /// Driver command line, with a `{port}` placeholder.
    pub fn default_command(&self) -> Vec<String> {
        let command: &[&str] = match self {
            EngineKind::Chrome => &["chromedriver", "--port={port}"],
            EngineKind::Firefox => &["geckodriver", "--port", "{port}"],
        };
        command.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EngineKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chrome" => Ok(EngineKind::Chrome),
            "firefox" => Ok(EngineKind::Firefox),
            _ => Err(PoolError::UnknownEngine(s.to_string())),
        }
    }
}

/// Where a running engine can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEndpoint {
    pub port: u16,
    pub url: String,
}

impl EngineEndpoint {
    fn local(port: u16) -> Self {
        Self {
            port,
            url: format!("http://127.0.0.1:{}", port),
        }
    }
}

impl fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A running engine process.
pub struct EngineProcess {
    config: EngineConfig,
    pid: Option<u32>,
    endpoint: EngineEndpoint,
    lifeline: Lifeline,
}

impl fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineProcess")
            .field("kind", &self.config.kind)
            .field("pid", &self.pid)
            .field("endpoint", &self.endpoint.url)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl EngineProcess {
    /// Starts an engine, retrying up to `config.spawn_attempts` times.
    pub async fn spawn(config: &EngineConfig) -> Result<Self> {
        let attempts = config.spawn_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Self::try_spawn(config).await {
                Ok(engine) => {
                    tracing::debug!(
                        engine = %config.kind,
                        pid = ?engine.pid,
                        endpoint = %engine.endpoint,
                        attempt,
                        "Engine started"
                    );
                    return Ok(engine);
                }
                Err(e) => {
                    tracing::warn!(engine = %config.kind, attempt, attempts, error = %e, "Engine failed to start");
                    last_error = Some(e);
                }
            }
        }

        Err(PoolError::Spawn(format!(
            "{} engine did not start after {} attempts: {}",
            config.kind,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn try_spawn(config: &EngineConfig) -> Result<Self> {
        let port = free_port()?;
        let argv = config.command_for(port);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PoolError::Spawn("empty engine command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Own process group, so the engine and the browsers it launches can be
        // killed together.
        #[cfg(unix)]
        command.process_group(0);

        die_with_parent(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {}", program, e)))?;
        let pid = child.id();

        if config.wait_for_port {
            wait_for_port(&mut child, port, config.spawn_timeout).await?;
        } else {
            tokio::time::sleep(STARTUP_GRACE).await;
            if let Some(status) = child.try_wait()? {
                return Err(PoolError::Spawn(format!(
                    "{} exited during startup ({})",
                    program, status
                )));
            }
        }

        Ok(Self {
            config: config.clone(),
            pid,
            endpoint: EngineEndpoint::local(port),
            lifeline: Lifeline::watch(child),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn lifeline_pid(&self) -> u32 {
        self.lifeline.pid()
    }

    pub fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    pub fn kind(&self) -> EngineKind {
        self.config.kind
    }

    pub fn is_alive(&self) -> bool {
        self.lifeline.is_alive()
    }

    /// Kills the engine and starts a fresh one with the same configuration.
    pub async fn reboot(&mut self) -> Result<()> {
        tracing::info!(engine = %self.config.kind, pid = ?self.pid, "Rebooting engine");
        self.lifeline.terminate().await;
        *self = Self::spawn(&self.config).await?;
        Ok(())
    }

    /// Kills the engine. With `wait` this returns once the process is
    /// reaped, otherwise the kill happens in the background.
    pub async fn shutdown(&mut self, wait: bool) {
        if wait {
            self.lifeline.terminate().await;
        } else {
            self.lifeline.abandon();
        }
    }
}

/// Has the kernel kill the engine when this process dies.
#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut Command) {
    // SAFETY: prctl is async-signal-safe and the closure touches no state of
    // the parent process.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_command: &mut Command) {}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

async fn wait_for_port(child: &mut Child, port: u16, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(PoolError::Spawn(format!(
                "engine exited during startup ({})",
                status
            )));
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PoolError::Spawn(format!(
                "engine did not open port {} within {:?}",
                port, timeout
            )));
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_engines() {
        assert_eq!("chrome".parse::<EngineKind>().unwrap(), EngineKind::Chrome);
        assert_eq!(" Firefox ".parse::<EngineKind>().unwrap(), EngineKind::Firefox);

        let err = "lynx".parse::<EngineKind>().unwrap_err();
        assert!(matches!(err, PoolError::UnknownEngine(ref name) if name == "lynx"));
    }

    #[test]
    fn free_ports_are_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }
}
