use super::{
    ContainerDetail, ContainerEngine, ContainerSpec, EngineEvent, ImageDetail, NetworkAttachment,
    NetworkSummary, RegistryAuth,
};
use crate::error::EngineError;
use crate::types::{ContainerRecord, EndpointConfig};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::EndpointSettings;
use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Buffered events between the listener task and the reconciliation loop.
const EVENT_BUFFER: usize = 256;

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the local Docker daemon, or to `socket` when given.
    pub fn connect(socket: Option<&str>, timeout_secs: u64) -> Result<Self, EngineError> {
        let docker = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?.with_timeout(
                std::time::Duration::from_secs(timeout_secs),
            ),
        };
        Ok(Self { docker })
    }
}

fn not_found(err: bollard::errors::Error, what: impl FnOnce() -> EngineError) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => what(),
        other => EngineError::Docker(other),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, EngineError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ContainerRecord::new(
                    id,
                    c.names.unwrap_or_default(),
                    c.image.unwrap_or_default(),
                    c.labels.unwrap_or_default(),
                ))
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, EngineError> {
        let detail = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| not_found(e, || EngineError::ContainerNotFound(id.to_string())))?;

        let config = detail.config.unwrap_or_default();
        let networks = detail
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, settings)| (name, attachment_from(settings)))
            .collect();

        Ok(ContainerDetail {
            id: detail.id.unwrap_or_else(|| id.to_string()),
            name: detail
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image_id: detail.image.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            hostname: config.hostname.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            networks,
            host_config: detail.host_config.unwrap_or_default(),
        })
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetail, EngineError> {
        let image = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| not_found(e, || EngineError::ImageNotFound(reference.to_string())))?;
        Ok(ImageDetail {
            id: image.id.unwrap_or_default(),
            repo_tags: image.repo_tags.unwrap_or_default(),
        })
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), EngineError> {
        let opts = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            serveraddress: Some(a.server_address.clone()),
            ..Default::default()
        });

        let mut progress = self.docker.create_image(Some(opts), None, credentials);
        while let Some(item) = progress.next().await {
            let info = item?;
            if let Some(status) = info.status {
                debug!("Pull {}: {}", reference, status);
            }
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| not_found(e, || EngineError::ContainerNotFound(id.to_string())))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| not_found(e, || EngineError::ContainerNotFound(id.to_string())))
    }

    async fn remove_image(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_image(
                id,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
            .map_err(|e| not_found(e, || EngineError::ImageNotFound(id.to_string())))?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let as_set = |items: &[String]| -> HashMap<String, HashMap<(), ()>> {
            items
                .iter()
                .map(|item| (item.clone(), HashMap::new()))
                .collect()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            exposed_ports: Some(as_set(&spec.exposed_ports)),
            volumes: Some(as_set(&spec.volumes)),
            labels: Some(spec.labels.clone()),
            host_config: Some(spec.host_config.clone()),
            ..Default::default()
        };
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self.docker.create_container(Some(opts), config).await?;
        for warning in created.warnings {
            warn!("Create {}: {}", spec.name, warning);
        }
        if created.id.is_empty() {
            return Err(EngineError::Other(format!(
                "engine returned no id for {}",
                spec.name
            )));
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found(e, || EngineError::ContainerNotFound(id.to_string())))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(NetworkSummary {
                    id: n.id?,
                    name: n.name?,
                })
            })
            .collect())
    }

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
        endpoints: &EndpointConfig,
    ) -> Result<(), EngineError> {
        let opts = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings {
                links: Some(endpoints.links.clone()),
                aliases: Some(endpoints.aliases.clone()),
                ..Default::default()
            },
        };
        self.docker.connect_network(network_id, opts).await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network_id: &str,
        container_id: &str,
    ) -> Result<(), EngineError> {
        let opts = DisconnectNetworkOptions {
            container: container_id.to_string(),
            force: true,
        };
        self.docker.disconnect_network(network_id, opts).await?;
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "die", "stop"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = docker.events(Some(opts));
            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let item = match msg {
                    Ok(event) => {
                        let id = event.actor.and_then(|a| a.id).unwrap_or_default();
                        let action = event.action.unwrap_or_default();
                        if id.is_empty() {
                            continue;
                        }
                        debug!("Container event: {} for {}", action, id);
                        match action.as_str() {
                            "start" => Ok(EngineEvent::Started(id)),
                            "stop" | "die" => Ok(EngineEvent::Stopped(id)),
                            _ => continue,
                        }
                    }
                    Err(e) => Err(EngineError::Docker(e)),
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            debug!("Docker event listener finished");
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

fn attachment_from(settings: EndpointSettings) -> NetworkAttachment {
    let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
    NetworkAttachment {
        network_id: settings.network_id.unwrap_or_default(),
        ipv4: non_empty(settings.ip_address),
        ipv6: non_empty(settings.global_ipv6_address),
        links: settings.links.unwrap_or_default(),
        aliases: settings.aliases.unwrap_or_default(),
    }
}
