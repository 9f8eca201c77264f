//! Container engine abstraction.
//!
//! The operator only talks to the engine through [`ContainerEngine`], which
//! speaks in the small value types below instead of raw API models. The
//! production implementation is [`DockerEngine`]; tests use the in-memory
//! engine in `mock`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::HostConfig;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{ContainerRecord, EndpointConfig};

pub mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerEngine;

/// Inspected state of one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    /// Id of the image the container was created from.
    pub image_id: String,
    /// Image reference from the container config.
    pub image: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub networks: HashMap<String, NetworkAttachment>,
    pub host_config: HostConfig,
}

impl ContainerDetail {
    pub fn to_record(&self) -> ContainerRecord {
        ContainerRecord::new(
            self.id.clone(),
            vec![self.name.clone()],
            self.image.clone(),
            self.labels.clone(),
        )
    }
}

/// One network a container is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub links: Vec<String>,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetail {
    pub id: String,
    pub repo_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: HashMap<String, String>,
    pub host_config: HostConfig,
}

/// Container lifecycle events the operator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Started(String),
    Stopped(String),
}

/// Credentials for one image registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Checks that the engine answers.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Lists running containers.
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, EngineError>;

    /// Inspects an image by id or reference.
    async fn inspect_image(&self, reference: &str) -> Result<ImageDetail, EngineError>;

    /// Pulls `reference`, anonymously when `auth` is `None`.
    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), EngineError>;

    /// Stops a container immediately with SIGKILL.
    async fn kill_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_image(&self, id: &str) -> Result<(), EngineError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError>;

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
        endpoints: &EndpointConfig,
    ) -> Result<(), EngineError>;

    /// Disconnects a container from a network, forcing it if running.
    async fn disconnect_network(
        &self,
        network_id: &str,
        container_id: &str,
    ) -> Result<(), EngineError>;

    /// Live container start/stop events. Errors are reported in-stream.
    fn events(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>>;
}
