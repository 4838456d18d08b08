//! Runtime control interface
//!
//! Launch, probe and shut down runtime instances, and request fixtures
//! for types that have no entity to test against. Used by pre-batch setup
//! and by remediation; workers never touch it.

use crate::config::RuntimeCommand;
use crate::error::RuntimeError;
use async_trait::async_trait;
use capcheck_model::TypeName;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Where and how many instances to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec {
    pub base_port: u16,
}

/// One running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeInstance {
    pub port: u16,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Unresponsive,
}

/// Control over runtime instances
#[async_trait]
pub trait RuntimeControl: Send + Sync {
    /// Start `count` instances on consecutive ports
    async fn launch(
        &self,
        spec: InstanceSpec,
        count: usize,
    ) -> Result<Vec<RuntimeInstance>, RuntimeError>;

    async fn shutdown(&self, port: u16) -> Result<(), RuntimeError>;

    async fn status(&self, port: u16) -> InstanceStatus;

    /// Make the runtime expose entities carrying these types on next start
    async fn add_fixtures(&self, types: &[TypeName]) -> Result<(), RuntimeError>;
}

/// Restart the given instances: shut down, relaunch, wait until responsive
pub async fn restart(
    control: &dyn RuntimeControl,
    ports: &[u16],
    probes: u32,
    interval: Duration,
) -> Result<(), RuntimeError> {
    for &port in ports {
        control.shutdown(port).await?;
        control.launch(InstanceSpec { base_port: port }, 1).await?;
        wait_until_running(control, port, probes, interval).await?;
    }
    Ok(())
}

/// Probe until an instance reports running
pub async fn wait_until_running(
    control: &dyn RuntimeControl,
    port: u16,
    probes: u32,
    interval: Duration,
) -> Result<(), RuntimeError> {
    for attempt in 0..probes {
        if control.status(port).await == InstanceStatus::Running {
            tracing::debug!(port, attempt, "Runtime responsive");
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
    Err(RuntimeError::Unresponsive {
        port,
        attempts: probes,
    })
}

/// Instances run as child processes of a configured command
///
/// The instance's port is passed through the configured environment
/// variable. Fixture requests are accumulated and passed to new instances
/// through `CAPCHECK_FIXTURES` as a comma-separated list of type names.
#[derive(Debug)]
pub struct ProcessRuntimeControl {
    command: RuntimeCommand,
    host: String,
    children: Mutex<HashMap<u16, Child>>,
    fixtures: Mutex<Vec<TypeName>>,
}

/// Environment variable carrying requested fixtures
pub const FIXTURES_ENV: &str = "CAPCHECK_FIXTURES";

impl ProcessRuntimeControl {
    #[must_use]
    pub fn new(command: RuntimeCommand, host: impl Into<String>) -> Self {
        Self {
            command,
            host: host.into(),
            children: Mutex::new(HashMap::new()),
            fixtures: Mutex::new(Vec::new()),
        }
    }

    /// Fixtures requested so far
    #[must_use]
    pub fn fixtures(&self) -> Vec<TypeName> {
        self.fixtures.lock().clone()
    }

    fn spawn_one(&self, program: &str, port: u16) -> Result<RuntimeInstance, RuntimeError> {
        let fixtures = self
            .fixtures
            .lock()
            .iter()
            .map(TypeName::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let child = Command::new(program)
            .args(&self.command.args)
            .env(&self.command.port_env, port.to_string())
            .env(FIXTURES_ENV, fixtures)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Launch { port, source })?;
        let instance = RuntimeInstance {
            port,
            pid: child.id(),
        };
        tracing::info!(port, pid = ?instance.pid, "Launched runtime");
        self.children.lock().insert(port, child);
        Ok(instance)
    }
}

#[async_trait]
impl RuntimeControl for ProcessRuntimeControl {
    async fn launch(
        &self,
        spec: InstanceSpec,
        count: usize,
    ) -> Result<Vec<RuntimeInstance>, RuntimeError> {
        let program = self
            .command
            .program
            .as_deref()
            .ok_or(RuntimeError::NotConfigured)?;
        (0..count)
            .map(|offset| {
                let port = u16::try_from(offset)
                    .ok()
                    .and_then(|offset| spec.base_port.checked_add(offset))
                    .ok_or_else(|| RuntimeError::Launch {
                        port: spec.base_port,
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "port range overflow",
                        ),
                    })?;
                self.spawn_one(program, port)
            })
            .collect()
    }

    async fn shutdown(&self, port: u16) -> Result<(), RuntimeError> {
        let child = self.children.lock().remove(&port);
        let Some(mut child) = child else {
            return Ok(());
        };
        child.kill().await.map_err(|e| RuntimeError::Shutdown {
            port,
            reason: e.to_string(),
        })?;
        tracing::info!(port, "Runtime shut down");
        Ok(())
    }

    async fn status(&self, port: u16) -> InstanceStatus {
        match tokio::net::TcpStream::connect((self.host.as_str(), port)).await {
            Ok(_) => InstanceStatus::Running,
            Err(_) => InstanceStatus::Unresponsive,
        }
    }

    async fn add_fixtures(&self, types: &[TypeName]) -> Result<(), RuntimeError> {
        let mut fixtures = self.fixtures.lock();
        for name in types {
            if !fixtures.contains(name) {
                fixtures.push(name.clone());
            }
        }
        tracing::warn!(requested = ?types, "Fixtures requested for next launch");
        Ok(())
    }
}

/// Control for runtimes managed outside this process
///
/// Launch and shutdown are no-ops; status probes the port.
#[derive(Debug, Clone)]
pub struct ExternalRuntimeControl {
    host: String,
}

impl ExternalRuntimeControl {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl RuntimeControl for ExternalRuntimeControl {
    async fn launch(
        &self,
        spec: InstanceSpec,
        count: usize,
    ) -> Result<Vec<RuntimeInstance>, RuntimeError> {
        Ok((0..count)
            .filter_map(|offset| u16::try_from(offset).ok())
            .filter_map(|offset| spec.base_port.checked_add(offset))
            .map(|port| RuntimeInstance { port, pid: None })
            .collect())
    }

    async fn shutdown(&self, _port: u16) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn status(&self, port: u16) -> InstanceStatus {
        match tokio::net::TcpStream::connect((self.host.as_str(), port)).await {
            Ok(_) => InstanceStatus::Running,
            Err(_) => InstanceStatus::Unresponsive,
        }
    }

    async fn add_fixtures(&self, types: &[TypeName]) -> Result<(), RuntimeError> {
        Err(RuntimeError::Fixture(format!(
            "externally managed runtime cannot add fixtures for {types:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_process_control_refuses_launch() {
        let control = ProcessRuntimeControl::new(RuntimeCommand::default(), "127.0.0.1");
        let err = control
            .launch(InstanceSpec { base_port: 15702 }, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotConfigured));
        control.shutdown(15702).await.unwrap();
    }

    #[tokio::test]
    async fn fixtures_accumulate_without_duplicates() {
        let control = ProcessRuntimeControl::new(RuntimeCommand::default(), "127.0.0.1");
        control.add_fixtures(&[TypeName::new("A")]).await.unwrap();
        control
            .add_fixtures(&[TypeName::new("A"), TypeName::new("B")])
            .await
            .unwrap();
        assert_eq!(control.fixtures(), vec![TypeName::new("A"), TypeName::new("B")]);
    }

    #[tokio::test]
    async fn external_control_lists_consecutive_ports() {
        let control = ExternalRuntimeControl::new("127.0.0.1");
        let instances = control
            .launch(InstanceSpec { base_port: 30_001 }, 3)
            .await
            .unwrap();
        let ports: Vec<u16> = instances.iter().map(|i| i.port).collect();
        assert_eq!(ports, vec![30_001, 30_002, 30_003]);
    }

    #[tokio::test]
    async fn wait_gives_up_after_probes() {
        // Port 9 (discard) is not expected to accept connections locally.
        let control = ExternalRuntimeControl::new("127.0.0.1");
        let err = wait_until_running(&control, 9, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unresponsive { port: 9, attempts: 2 }));
    }
}
