use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, ContainerSummary, EndpointSettings, HostConfig, PortBinding,
    PortTypeEnum,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ContainerEngine, ContainerInfo, LogStream, NetworkInfo, PodInfo, RunSpec};
use crate::error::{Error, Result};

/// Infra container backing a pod: holds the shared network namespace the
/// way podman's own infra container does.
const POD_INFRA_IMAGE: &str = "k8s.gcr.io/pause:3.5";
const POD_NAME_PREFIX: &str = "pod-";
const LABEL_POD: &str = "pod";
const LABEL_POD_NAME: &str = "pod.name";

const LOG_CHANNEL_CAPACITY: usize = 64;

/// Provider speaking to the local Docker (or Podman-compatible) socket.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|err| {
            Error::internal("failed to connect to the container engine socket").with_source(err)
        })?;
        Ok(Self { docker })
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(%image, "pulling image");
        let options = CreateImageOptions::<String> {
            from_image: image.to_owned(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            let step = step.map_err(|err| {
                Error::internal(format!("failed to pull image {image}")).with_source(err)
            })?;
            if let Some(error) = step.error {
                return Err(Error::internal(format!("failed to pull image {image}: {error}")));
            }
            if let Some(status) = step.status {
                trace!(%image, %status, "pull progress");
            }
        }
        Ok(())
    }

    fn pod_container(name: &str) -> String {
        format!("{POD_NAME_PREFIX}{name}")
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.pull(image).await,
            Err(err) => {
                Err(Error::internal(format!("failed to inspect image {image}")).with_source(err))
            }
        }
    }

    async fn run(&self, spec: RunSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let host_ip = if spec.expose_external { "0.0.0.0" } else { "127.0.0.1" };
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        if spec.pod.is_none() {
            for (host_port, container_port) in &spec.ports {
                let key = format!("{container_port}/tcp");
                exposed_ports.entry(key.clone()).or_default();
                let bindings = port_bindings.entry(key).or_insert_with(|| Some(Vec::new()));
                if let Some(bindings) = bindings {
                    bindings.push(PortBinding {
                        host_ip: Some(host_ip.to_owned()),
                        host_port: Some(host_port.clone()),
                    });
                }
            }
        } else if !spec.ports.is_empty() {
            // Port publishing lives on the pod's infra container.
            debug!(container = %spec.name, "ignoring port map for pod member");
        }

        let network_mode = match (&spec.pod, &spec.network) {
            (Some(pod), _) => Some(format!("container:{}", Self::pod_container(pod))),
            (None, Some(network)) => Some(network.clone()),
            (None, None) => None,
        };

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                if m.read_only {
                    format!("{}:{}:ro", m.source, m.target)
                } else {
                    format!("{}:{}", m.source, m.target)
                }
            })
            .collect();

        let config = Config::<String> {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                binds: (!binds.is_empty()).then_some(binds),
                network_mode,
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|err| map_container_error("container", &spec.name, "create", err))?;

        if let Err(err) = self
            .docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
        {
            // Best effort: do not leave a created-but-dead container behind.
            if let Err(cleanup) = self
                .docker
                .remove_container(
                    &spec.name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(container = %spec.name, error = %cleanup, "cleanup after failed start");
            }
            return Err(map_container_error("container", &spec.name, "start", err));
        }

        Ok(created.id)
    }

    async fn stop(&self, name: &str, timeout_secs: i64) -> Result<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(map_container_error("container", name, "stop", err)),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| map_container_error("container", name, "remove", err))
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| Error::internal("failed to list containers").with_source(err))?;
        Ok(summaries.into_iter().map(summary_to_info).collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let details = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|err| map_container_error("container", name, "inspect", err))?;

        let mut info = ContainerInfo {
            id: details.id.unwrap_or_default(),
            name: details
                .name
                .map(|n| n.trim_start_matches('/').to_owned())
                .unwrap_or_default(),
            ..ContainerInfo::default()
        };
        if let Some(config) = details.config {
            info.image = config.image.unwrap_or_default();
            info.labels = config.labels.unwrap_or_default().into_iter().collect();
        }
        if let Some(state) = details.state {
            info.status = state.status.map(state_status).unwrap_or_default();
        }
        if let Some(settings) = details.network_settings {
            if let Some(ports) = settings.ports {
                for (key, bindings) in ports {
                    let Some(bindings) = bindings else { continue };
                    if let Some(binding) = bindings.first() {
                        let host_ip = binding.host_ip.clone().unwrap_or_default();
                        let host_port = binding.host_port.clone().unwrap_or_default();
                        info.ports.insert(key, format!("{host_ip}:{host_port}"));
                    }
                }
            }
            if let Some(networks) = settings.networks {
                let networks: BTreeMap<String, EndpointSettings> = networks.into_iter().collect();
                info.ip_address = networks
                    .values()
                    .find_map(|endpoint| {
                        endpoint.ip_address.clone().filter(|ip| !ip.is_empty())
                    })
                    .unwrap_or_default();
                info.networks = networks.into_keys().collect();
            }
        }
        Ok(info)
    }

    async fn logs(&self, name: &str, follow: bool, tail: Option<u32>) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_owned(), |n| n.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let (stdout_tx, stdout_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let sent = match item {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        stdout_tx
                            .send(String::from_utf8_lossy(&message).into_owned())
                            .await
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr_tx
                            .send(String::from_utf8_lossy(&message).into_owned())
                            .await
                    }
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(err) => {
                        let _ = stderr_tx.send(format!("log stream error: {err}")).await;
                        break;
                    }
                };
                if sent.is_err() {
                    // Consumer hung up.
                    break;
                }
            }
            // Both senders drop here, closing the channels.
        });
        Ok(LogStream {
            stdout: stdout_rx,
            stderr: stderr_rx,
        })
    }

    async fn create_pod(&self, name: &str) -> Result<String> {
        let spec = RunSpec {
            name: Self::pod_container(name),
            image: POD_INFRA_IMAGE.to_owned(),
            labels: BTreeMap::from([
                (LABEL_POD.to_owned(), "true".to_owned()),
                (LABEL_POD_NAME.to_owned(), name.to_owned()),
            ]),
            ..RunSpec::default()
        };
        self.run(spec).await
    }

    async fn remove_pod(&self, name: &str) -> Result<()> {
        self.remove(&Self::pod_container(name), true).await
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_owned(), vec![format!("{LABEL_POD}=true")])]),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| Error::internal("failed to list pods").with_source(err))?;
        Ok(summaries
            .into_iter()
            .map(|summary| {
                let info = summary_to_info(summary);
                let name = info.label(LABEL_POD_NAME).unwrap_or(&info.name).to_owned();
                PodInfo {
                    id: info.id,
                    name,
                    status: info.status,
                }
            })
            .collect())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let options = CreateNetworkOptions::<String> {
            name: name.to_owned(),
            driver: "bridge".to_owned(),
            check_duplicate: true,
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|err| map_container_error("network", name, "create", err))?;
        Ok(response.id.unwrap_or_default())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|err| map_container_error("network", name, "remove", err))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|err| Error::internal("failed to list networks").with_source(err))?;
        Ok(networks
            .into_iter()
            .map(|network| NetworkInfo {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
            })
            .collect())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_owned(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
            .map_err(|err| map_container_error("network", network, "connect", err))
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_owned(),
                    force: false,
                },
            )
            .await
            .map_err(|err| map_container_error("network", network, "disconnect", err))
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| Error::internal("engine ping failed").with_source(err))
    }
}

fn map_container_error(
    resource: &str,
    name: &str,
    op: &str,
    err: bollard::errors::Error,
) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::not_found(resource, name).with_source(err_message(op, err)),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => Error::already_exists(resource, name).with_source(err_message(op, err)),
        err => Error::internal(format!("engine {op} of {resource} {name} failed")).with_source(err),
    }
}

fn err_message(op: &str, err: bollard::errors::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{op}: {err}"))
}

fn summary_to_info(summary: ContainerSummary) -> ContainerInfo {
    let mut ports = BTreeMap::new();
    for port in summary.ports.unwrap_or_default() {
        let Some(public) = port.public_port else { continue };
        let proto = match port.typ {
            Some(PortTypeEnum::UDP) => "udp",
            Some(PortTypeEnum::SCTP) => "sctp",
            _ => "tcp",
        };
        let key = format!("{}/{proto}", port.private_port);
        let host_ip = port.ip.unwrap_or_default();
        ports.entry(key).or_insert_with(|| format!("{host_ip}:{public}"));
    }

    let (ip_address, networks) = match summary.network_settings.and_then(|s| s.networks) {
        Some(networks) => {
            let networks: BTreeMap<String, EndpointSettings> = networks.into_iter().collect();
            let ip = networks
                .values()
                .find_map(|endpoint| endpoint.ip_address.clone().filter(|ip| !ip.is_empty()))
                .unwrap_or_default();
            (ip, networks.into_keys().collect())
        }
        None => (String::new(), Vec::new()),
    };

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|name| name.trim_start_matches('/').to_owned())
            .unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        status: summary.state.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default().into_iter().collect(),
        ports,
        ip_address,
        networks,
    }
}

fn state_status(status: ContainerStateStatusEnum) -> String {
    match status {
        ContainerStateStatusEnum::CREATED => "created",
        ContainerStateStatusEnum::RUNNING => "running",
        ContainerStateStatusEnum::PAUSED => "paused",
        ContainerStateStatusEnum::RESTARTING => "restarting",
        ContainerStateStatusEnum::REMOVING => "removing",
        ContainerStateStatusEnum::EXITED => "exited",
        ContainerStateStatusEnum::DEAD => "dead",
        ContainerStateStatusEnum::EMPTY => "",
    }
    .to_owned()
}
