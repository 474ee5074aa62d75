use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

/// Everything needed to start one container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Host port -> container port.
    pub ports: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Join the network namespace of this pod instead of a bridge.
    pub pod: Option<String>,
    /// Attach to this network at creation time.
    pub network: Option<String>,
    pub mounts: Vec<Mount>,
    /// Bind published ports on all interfaces instead of loopback.
    /// Application containers stay on loopback; the proxy asks for this.
    pub expose_external: bool,
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Engine view of a container, normalised across list and inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Engine status string: `running`, `exited`, `created`, ...
    pub status: String,
    pub labels: BTreeMap<String, String>,
    /// `"<containerPort>/<proto>" -> "<hostIP>:<hostPort>"`.
    pub ports: BTreeMap<String, String>,
    pub ip_address: String,
    pub networks: Vec<String>,
}

impl ContainerInfo {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.status.as_str(), "running" | "restarting")
    }

    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
}

/// One producer task per active stream feeds these; both channels close
/// when the stream ends, the consumer hangs up, or the task is cancelled,
/// so a draining reader always unblocks.
pub struct LogStream {
    pub stdout: mpsc::Receiver<String>,
    pub stderr: mpsc::Receiver<String>,
}

/// Capability over a local container engine.
///
/// The production provider speaks to the Docker/Podman socket; tests use
/// an in-memory fake. Callers never touch the engine client directly.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Make sure the image is present locally, pulling it if absent.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Ensure the image, create the container, start it, return its id.
    async fn run(&self, spec: RunSpec) -> Result<String>;

    async fn stop(&self, name: &str, timeout_secs: i64) -> Result<()>;

    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// All containers, stopped ones included when `all` is set.
    async fn list(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    async fn inspect(&self, name: &str) -> Result<ContainerInfo>;

    async fn logs(&self, name: &str, follow: bool, tail: Option<u32>) -> Result<LogStream>;

    async fn create_pod(&self, name: &str) -> Result<String>;
    async fn remove_pod(&self, name: &str) -> Result<()>;
    async fn list_pods(&self) -> Result<Vec<PodInfo>>;

    async fn create_network(&self, name: &str) -> Result<String>;
    async fn remove_network(&self, name: &str) -> Result<()>;
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    async fn connect_network(&self, network: &str, container: &str) -> Result<()>;
    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()>;

    /// Liveness of the engine socket; used by the readiness probe.
    async fn ping(&self) -> Result<()>;
}
