//! Shared operator state.
//!
//! [`Operator`] ties the engine, the registry and the DNS publisher
//! together. Its behaviour is split across modules: `replace` (drift checks
//! and container swaps), `network` (reattachment), `drivers` (driver-set
//! monitoring), `discovery` (startup) and `reconcile` (the main loop).
//!
//! Three locks guard the mutable state: the registry's own map lock, the
//! driver set, and `replacing`, which serializes container swaps host-wide.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::descriptor::{ComposeFile, ServiceConfig};
use crate::dns::{DnsClient, DnsPublisher, DnsTarget, GrpcDnsClient, RecordValues};
use crate::error::{DnsError, OperatorError, Result};
use crate::labels::LabelKeys;
use crate::registry::Registry;
use crate::runtime::ContainerEngine;
use crate::types::{DriverSet, PendingStart};

/// Builds a DNS client for a discovered management endpoint.
pub type DnsConnector =
    Arc<dyn Fn(&DnsTarget, &Config) -> Result<Arc<dyn DnsClient>, DnsError> + Send + Sync>;

pub struct Operator {
    pub(crate) engine: Arc<dyn ContainerEngine>,
    pub(crate) registry: Registry,
    pub(crate) config: Config,
    pub(crate) keys: LabelKeys,
    pub(crate) dns: RwLock<Option<Arc<DnsPublisher>>>,
    pub(crate) drivers: Mutex<DriverSet>,
    pub(crate) replacing: Mutex<()>,
    pub(crate) pending: Mutex<HashMap<String, PendingStart>>,
    connector: DnsConnector,
}

impl Operator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: Config) -> Self {
        let connector: DnsConnector = Arc::new(
            |target: &DnsTarget, config: &Config| -> Result<Arc<dyn DnsClient>, DnsError> {
                let client = GrpcDnsClient::new(
                    &target.mgmt_host,
                    config.dns_mgmt_port,
                    config.dns_token.as_deref(),
                )?;
                Ok(Arc::new(client) as Arc<dyn DnsClient>)
            },
        );
        Self::with_dns_connector(engine, config, connector)
    }

    pub fn with_dns_connector(
        engine: Arc<dyn ContainerEngine>,
        config: Config,
        connector: DnsConnector,
    ) -> Self {
        let keys = LabelKeys::new(&config.label_namespace);
        Self {
            engine,
            registry: Registry::new(),
            config,
            keys,
            dns: RwLock::new(None),
            drivers: Mutex::new(DriverSet::default()),
            replacing: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            connector,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) async fn dns_publisher(&self) -> Option<Arc<DnsPublisher>> {
        self.dns.read().await.clone()
    }

    pub(crate) async fn install_dns(&self, target: DnsTarget) -> Result<()> {
        let client = (self.connector)(&target, &self.config)?;
        info!(
            "DNS configured: server {} on {}, management at {}",
            target.resolver_ip, target.network, target.mgmt_host
        );
        let publisher = DnsPublisher::new(client, target, self.config.dns_ttl);
        *self.dns.write().await = Some(Arc::new(publisher));
        Ok(())
    }

    pub(crate) fn load_descriptor(&self) -> Result<ComposeFile> {
        Ok(ComposeFile::load(&self.config.compose_file)?)
    }

    /// Re-reads the descriptor and resolves the service for `image`.
    pub(crate) fn service_for(&self, image: &str) -> Result<ServiceConfig> {
        self.load_descriptor()?
            .resolve(image, |name| std::env::var(name).ok())
            .ok_or_else(|| OperatorError::NoService(image.to_string()))
    }

    /// Engine network names a service should be attached to.
    pub(crate) fn desired_networks(&self, service: &ServiceConfig) -> Vec<String> {
        if service.networks.is_empty() {
            return vec![self.config.network_name("default")];
        }
        service
            .networks
            .iter()
            .map(|n| self.config.network_name(n))
            .collect()
    }

    /// Publishes DNS records for a container that declares a zone.
    ///
    /// Best effort: failures are logged and never returned.
    pub async fn publish_dns(&self, container_id: &str) {
        if let Err(e) = self.try_publish_dns(container_id).await {
            error!("DNS publish for {} failed: {}", container_id, e);
        }
    }

    async fn try_publish_dns(&self, container_id: &str) -> Result<()> {
        let detail = self.engine.inspect_container(container_id).await?;
        let labels = self.keys.parse(&detail.labels);
        let Some(zone) = labels.dns_zone else {
            return Ok(());
        };
        let Some(publisher) = self.dns_publisher().await else {
            return Err(OperatorError::Discovery(
                "no DNS management service discovered yet".into(),
            ));
        };

        let network = labels
            .dns_network
            .map(|n| self.config.network_name(&n))
            .unwrap_or_else(|| publisher.target().network.clone());
        let attachment = detail.networks.get(&network).ok_or_else(|| {
            OperatorError::Discovery(format!(
                "container {} is not attached to network {}",
                detail.name, network
            ))
        })?;

        let values = RecordValues {
            ipv4: attachment.ipv4.clone(),
            ipv6: attachment.ipv6.clone(),
            hostname: detail.hostname.clone(),
        };
        info!(
            "Publishing DNS for {} in zone {} ({:?})",
            detail.name, zone, values.ipv4
        );
        publisher.publish(&zone, &values, &labels.dns_keys).await?;
        Ok(())
    }
}
