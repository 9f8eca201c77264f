//! In-memory container engine for tests.
//!
//! Keeps containers, images and networks in plain maps and records every
//! mutating call in order so tests can assert on the sequence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Barrier};

use super::{
    ContainerDetail, ContainerEngine, ContainerSpec, EngineEvent, ImageDetail, NetworkAttachment,
    NetworkSummary, RegistryAuth,
};
use crate::error::EngineError;
use crate::types::{ContainerRecord, EndpointConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pull(String),
    Kill(String),
    RemoveContainer(String),
    RemoveImage(String),
    Create(String),
    Start(String),
    Connect { network: String, container: String },
    Disconnect { network: String, container: String },
}

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerDetail>,
    /// Container ids that are created but not running.
    stopped: HashSet<String>,
    /// Local tag -> image id.
    tags: HashMap<String, String>,
    /// Tag -> image id a pull would fetch.
    remote: HashMap<String, String>,
    networks: Vec<NetworkSummary>,
    /// Registry server addresses that reject pulls; "" is anonymous.
    rejecting: HashSet<String>,
    fail_start: bool,
    /// Network ids whose connects fail.
    failing_networks: HashSet<String>,
    /// Every pull waits on this before completing.
    pull_barrier: Option<Arc<Barrier>>,
    unreachable: bool,
    next_id: u64,
    calls: Vec<Call>,
    specs: Vec<ContainerSpec>,
}

#[derive(Default)]
pub struct MockEngine {
    state: Mutex<State>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<EngineEvent, EngineError>>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running container bound to the image `tag` currently points at.
    pub fn add_container(&self, id: &str, name: &str, tag: &str, labels: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let image_id = state.tags.get(tag).cloned().unwrap_or_default();
        state.containers.insert(
            id.to_string(),
            ContainerDetail {
                id: id.to_string(),
                name: name.to_string(),
                image_id,
                image: tag.to_string(),
                hostname: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
        );
    }

    pub fn add_image(&self, tag: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.tags.insert(tag.to_string(), id.to_string());
        state.remote.entry(tag.to_string()).or_insert(id.to_string());
    }

    /// Makes the next pull of `tag` fetch image `id`.
    pub fn publish_remote(&self, tag: &str, id: &str) {
        self.state
            .lock()
            .unwrap()
            .remote
            .insert(tag.to_string(), id.to_string());
    }

    pub fn add_network(&self, id: &str, name: &str) {
        self.state.lock().unwrap().networks.push(NetworkSummary {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Attaches a container to a network directly, bypassing the call log.
    pub fn attach(&self, container: &str, network: &str, attachment: NetworkAttachment) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(container) {
            c.networks.insert(network.to_string(), attachment);
        }
    }

    pub fn set_hostname(&self, container: &str, hostname: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(container) {
            c.hostname = hostname.to_string();
        }
    }

    pub fn fail_connects_to(&self, network_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_networks
            .insert(network_id.to_string());
    }

    /// Makes pulls rendezvous on `barrier`, so a test can tell whether they
    /// are in flight at the same time.
    pub fn hold_pulls(&self, barrier: Arc<Barrier>) {
        self.state.lock().unwrap().pull_barrier = Some(barrier);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn reject_registry(&self, server_address: &str) {
        self.state
            .lock()
            .unwrap()
            .rejecting
            .insert(server_address.to_string());
    }

    pub fn fail_starts(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn remove(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn container(&self, id: &str) -> Option<ContainerDetail> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn container_named(&self, name: &str) -> Option<ContainerDetail> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.state.lock().unwrap().tags.values().any(|v| v == id)
    }

    /// Returns the sender side of the event stream handed out by `events`.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Result<EngineEvent, EngineError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.state.lock().unwrap().unreachable {
            return Err(EngineError::Other("cannot connect to the engine".to_string()));
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, EngineError> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<ContainerRecord> = state
            .containers
            .values()
            .filter(|c| !state.stopped.contains(&c.id))
            .map(ContainerDetail::to_record)
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, EngineError> {
        tokio::task::yield_now().await;
        self.container(id)
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetail, EngineError> {
        let state = self.state.lock().unwrap();
        if let Some(id) = state.tags.get(reference) {
            return Ok(ImageDetail {
                id: id.clone(),
                repo_tags: vec![reference.to_string()],
            });
        }
        let repo_tags: Vec<String> = state
            .tags
            .iter()
            .filter(|(_, id)| id.as_str() == reference)
            .map(|(tag, _)| tag.clone())
            .collect();
        if repo_tags.is_empty() && !state.containers.values().any(|c| c.image_id == reference) {
            return Err(EngineError::ImageNotFound(reference.to_string()));
        }
        Ok(ImageDetail {
            id: reference.to_string(),
            repo_tags,
        })
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.record(Call::Pull(reference.to_string()));
        let barrier = self.state.lock().unwrap().pull_barrier.clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let mut state = self.state.lock().unwrap();
        let server = auth.map(|a| a.server_address.as_str()).unwrap_or("");
        if state.rejecting.contains(server) {
            return Err(EngineError::Other(format!("unauthorized: {}", server)));
        }
        let id = state
            .remote
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::ImageNotFound(reference.to_string()))?;
        state.tags.insert(reference.to_string(), id);
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.record(Call::Kill(id.to_string()));
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        state.stopped.insert(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.record(Call::RemoveContainer(id.to_string()));
        let mut state = self.state.lock().unwrap();
        state.stopped.remove(id);
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))
    }

    async fn remove_image(&self, id: &str) -> Result<(), EngineError> {
        self.record(Call::RemoveImage(id.to_string()));
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.image_id == id) {
            return Err(EngineError::Other(format!("image {} is in use", id)));
        }
        state.tags.retain(|_, v| v != id);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        tokio::task::yield_now().await;
        self.record(Call::Create(spec.name.clone()));
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Other(format!("name {} already in use", spec.name)));
        }
        state.next_id += 1;
        let id = format!("{:012x}{:052x}", 0xc0ffee_u64 + state.next_id, state.next_id);
        let image_id = state.tags.get(&spec.image).cloned().unwrap_or_default();
        state.containers.insert(
            id.clone(),
            ContainerDetail {
                id: id.clone(),
                name: spec.name.clone(),
                image_id,
                image: spec.image.clone(),
                hostname: spec.name.clone(),
                labels: spec.labels.clone(),
                networks: HashMap::new(),
                host_config: spec.host_config.clone(),
            },
        );
        state.stopped.insert(id.clone());
        state.specs.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.record(Call::Start(id.to_string()));
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(EngineError::Other("port is already allocated".to_string()));
        }
        if !state.containers.contains_key(id) {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        state.stopped.remove(id);
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        Ok(self.state.lock().unwrap().networks.clone())
    }

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
        endpoints: &EndpointConfig,
    ) -> Result<(), EngineError> {
        self.record(Call::Connect {
            network: network_id.to_string(),
            container: container_id.to_string(),
        });
        let mut state = self.state.lock().unwrap();
        if state.failing_networks.contains(network_id) {
            return Err(EngineError::Other(format!("network {} is full", network_id)));
        }
        let name = state
            .networks
            .iter()
            .find(|n| n.id == network_id)
            .map(|n| n.name.clone())
            .ok_or_else(|| EngineError::Other(format!("no network {}", network_id)))?;
        let ordinal = state.containers.len();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        container.networks.insert(
            name,
            NetworkAttachment {
                network_id: network_id.to_string(),
                ipv4: Some(format!("10.0.0.{}", ordinal + 1)),
                ipv6: None,
                links: endpoints.links.clone(),
                aliases: endpoints.aliases.clone(),
            },
        );
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network_id: &str,
        container_id: &str,
    ) -> Result<(), EngineError> {
        self.record(Call::Disconnect {
            network: network_id.to_string(),
            container: container_id.to_string(),
        });
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        container.networks.retain(|_, a| a.network_id != network_id);
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
        match self.events.lock().unwrap().take() {
            Some(rx) => {
                stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) })
                    .boxed()
            }
            None => stream::pending().boxed(),
        }
    }
}
