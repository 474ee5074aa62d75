//! In-memory engine double used by controller and API tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ContainerEngine, ContainerInfo, LogStream, NetworkInfo, PodInfo, RunSpec};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, ContainerInfo>,
    logs: BTreeMap<String, Vec<String>>,
    pods: BTreeMap<String, PodInfo>,
    networks: BTreeMap<String, NetworkInfo>,
    images: BTreeSet<String>,
    pulls: Vec<String>,
    failing_images: BTreeSet<String>,
    unreachable: bool,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeEngine {
    inner: Mutex<Inner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_reachable(inner: &Inner) -> Result<()> {
        if inner.unreachable {
            return Err(Error::internal("engine unreachable"));
        }
        Ok(())
    }

    /// Every subsequent call fails as if the socket were gone.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// Pulls of this image will fail.
    pub fn fail_image(&self, image: &str) {
        self.inner.lock().unwrap().failing_images.insert(image.to_owned());
    }

    pub fn clear_image_failures(&self) {
        self.inner.lock().unwrap().failing_images.clear();
    }

    pub fn pull_count(&self, image: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pulls
            .iter()
            .filter(|pulled| pulled.as_str() == image)
            .count()
    }

    /// Seed a container as if something outside the reconciler started it.
    pub fn insert_container(&self, info: ContainerInfo) {
        self.inner.lock().unwrap().containers.insert(info.name.clone(), info);
    }

    pub fn set_status(&self, name: &str, status: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.get_mut(name) {
            container.status = status.to_owned();
        }
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.inner.lock().unwrap().containers.get(name).cloned()
    }

    pub fn push_log(&self, name: &str, line: &str) {
        self.inner
            .lock()
            .unwrap()
            .logs
            .entry(name.to_owned())
            .or_default()
            .push(line.to_owned());
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        if inner.failing_images.contains(image) {
            inner.pulls.push(image.to_owned());
            return Err(Error::internal(format!("failed to pull image {image}")));
        }
        if inner.images.insert(image.to_owned()) {
            inner.pulls.push(image.to_owned());
        }
        Ok(())
    }

    async fn run(&self, spec: RunSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        if inner.containers.contains_key(&spec.name) {
            return Err(Error::already_exists("container", &spec.name));
        }
        inner.next_id += 1;
        let id = format!("ctr-{}", inner.next_id);
        let host_ip = if spec.expose_external { "0.0.0.0" } else { "127.0.0.1" };
        let ports = spec
            .ports
            .iter()
            .map(|(host, container)| (format!("{container}/tcp"), format!("{host_ip}:{host}")))
            .collect();
        let networks = match (&spec.pod, &spec.network) {
            (Some(_), _) => Vec::new(),
            (None, Some(network)) => vec![network.clone()],
            (None, None) => vec!["bridge".to_owned()],
        };
        let info = ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image,
            status: "running".to_owned(),
            labels: spec.labels,
            ports,
            ip_address: format!("172.18.0.{}", inner.next_id),
            networks,
        };
        inner.containers.insert(spec.name, info);
        Ok(id)
    }

    async fn stop(&self, name: &str, _timeout_secs: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        match inner.containers.get_mut(name) {
            Some(container) => {
                container.status = "exited".to_owned();
                Ok(())
            }
            None => Err(Error::not_found("container", name)),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        match inner.containers.get(name) {
            Some(container) if container.is_running() && !force => {
                Err(Error::invalid_input(format!("container {name} is running")))
            }
            Some(_) => {
                inner.containers.remove(name);
                Ok(())
            }
            None => Err(Error::not_found("container", name)),
        }
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        Ok(inner
            .containers
            .values()
            .filter(|container| all || container.is_running())
            .cloned()
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        inner
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("container", name))
    }

    async fn logs(&self, name: &str, _follow: bool, tail: Option<u32>) -> Result<LogStream> {
        let lines = {
            let inner = self.inner.lock().unwrap();
            Self::check_reachable(&inner)?;
            if !inner.containers.contains_key(name) {
                return Err(Error::not_found("container", name));
            }
            inner.logs.get(name).cloned().unwrap_or_default()
        };
        let skip = tail.map_or(0, |tail| lines.len().saturating_sub(tail as usize));
        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (_stderr_tx, stderr_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for line in lines.into_iter().skip(skip) {
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(LogStream {
            stdout: stdout_rx,
            stderr: stderr_rx,
        })
    }

    async fn create_pod(&self, name: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        if inner.pods.contains_key(name) {
            return Err(Error::already_exists("pod", name));
        }
        inner.next_id += 1;
        let id = format!("pod-{}", inner.next_id);
        inner.pods.insert(
            name.to_owned(),
            PodInfo {
                id: id.clone(),
                name: name.to_owned(),
                status: "running".to_owned(),
            },
        );
        Ok(id)
    }

    async fn remove_pod(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        inner.pods.remove(name);
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>> {
        let inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        Ok(inner.pods.values().cloned().collect())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        if inner.networks.contains_key(name) {
            return Err(Error::already_exists("network", name));
        }
        inner.next_id += 1;
        let id = format!("net-{}", inner.next_id);
        inner.networks.insert(
            name.to_owned(),
            NetworkInfo {
                id: id.clone(),
                name: name.to_owned(),
                driver: "bridge".to_owned(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        inner.networks.remove(name);
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        Ok(inner.networks.values().cloned().collect())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        if !inner.networks.contains_key(network) {
            return Err(Error::not_found("network", network));
        }
        let Some(info) = inner.containers.get_mut(container) else {
            return Err(Error::not_found("container", container));
        };
        if !info.networks.iter().any(|n| n == network) {
            info.networks.push(network.to_owned());
        }
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        if let Some(info) = inner.containers.get_mut(container) {
            info.networks.retain(|n| n != network);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        Self::check_reachable(&inner)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn spec(name: &str) -> RunSpec {
        RunSpec {
            name: name.to_owned(),
            image: "nginx:latest".to_owned(),
            ports: BTreeMap::from([("8080".to_owned(), "80".to_owned())]),
            ..RunSpec::default()
        }
    }

    #[tokio::test]
    async fn run_stop_inspect_remove_cycle() {
        let engine = FakeEngine::new();
        let id = engine.run(spec("web")).await.unwrap();

        let info = engine.inspect("web").await.unwrap();
        assert_eq!(info.id, id);
        assert!(info.is_running());

        engine.stop("web", 10).await.unwrap();
        assert_eq!(engine.inspect("web").await.unwrap().status, "exited");

        // A stopped container comes off without force.
        engine.remove("web", false).await.unwrap();
        assert!(engine.inspect("web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn running_container_needs_force_to_remove() {
        let engine = FakeEngine::new();
        engine.run(spec("web")).await.unwrap();

        assert!(engine.remove("web", false).await.is_err());
        engine.remove("web", true).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let engine = FakeEngine::new();
        engine.run(spec("web")).await.unwrap();
        let err = engine.run(spec("web")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn network_attach_and_detach_update_the_container() {
        let engine = FakeEngine::new();
        engine.run(spec("web")).await.unwrap();
        engine.create_network("internal").await.unwrap();

        engine.connect_network("internal", "web").await.unwrap();
        assert!(engine
            .inspect("web")
            .await
            .unwrap()
            .networks
            .iter()
            .any(|n| n == "internal"));

        engine.disconnect_network("internal", "web").await.unwrap();
        assert!(!engine
            .inspect("web")
            .await
            .unwrap()
            .networks
            .iter()
            .any(|n| n == "internal"));
    }

    #[tokio::test]
    async fn logs_drain_and_close() {
        let engine = FakeEngine::new();
        engine.run(spec("web")).await.unwrap();
        engine.push_log("web", "one\n");
        engine.push_log("web", "two\n");

        let mut stream = engine.logs("web", false, None).await.unwrap();
        assert_eq!(stream.stdout.recv().await.as_deref(), Some("one\n"));
        assert_eq!(stream.stdout.recv().await.as_deref(), Some("two\n"));
        // Producer is done: the channel closes so a reader unblocks.
        assert_eq!(stream.stdout.recv().await, None);
    }

    #[tokio::test]
    async fn list_without_all_hides_stopped_containers() {
        let engine = FakeEngine::new();
        engine.run(spec("web")).await.unwrap();
        engine.run(spec("worker")).await.unwrap();
        engine.stop("worker", 10).await.unwrap();

        assert_eq!(engine.list(false).await.unwrap().len(), 1);
        assert_eq!(engine.list(true).await.unwrap().len(), 2);
    }
}
