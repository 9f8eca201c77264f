//! Startup discovery.
//!
//! Before the reconciliation loop starts, the operator waits for the compose
//! services to come up, locates the DNS server and its management API among
//! the running containers, and recreates containers that need the DNS server
//! as their resolver.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::time::sleep;

use crate::dns::DnsTarget;
use crate::error::{OperatorError, Result};
use crate::operator::Operator;

const WAIT_POLL: Duration = Duration::from_secs(5);

impl Operator {
    /// Fails when the engine does not answer or the descriptor cannot be
    /// read. Both are fatal at startup.
    pub async fn check_startup(&self) -> Result<()> {
        self.engine.ping().await?;
        let services = self.load_descriptor()?.services.len();
        info!(
            "Engine reachable, descriptor {} declares {} services",
            self.config.compose_file.display(),
            services
        );
        Ok(())
    }

    /// Waits until as many containers run as the descriptor declares
    /// services, or until the configured startup wait elapses.
    pub async fn wait_for_services(&self) -> Result<()> {
        if self.config.startup_wait_secs == 0 {
            return Ok(());
        }
        let expected = self.load_descriptor()?.services.len();
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_wait_secs);

        loop {
            let running = self.engine.list_containers().await?.len();
            info!("Waiting for services: {}/{} running", running, expected);
            if running >= expected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Gave up waiting after {}s with {}/{} services running",
                    self.config.startup_wait_secs, running, expected
                );
                return Ok(());
            }
            sleep(WAIT_POLL).await;
        }
    }

    /// Locates the DNS server and management containers.
    pub async fn locate_dns(&self) -> Result<DnsTarget> {
        let containers = self.engine.list_containers().await?;
        let mut server: Option<(String, String)> = None;
        let mut mgmt_host: Option<String> = None;

        for container in &containers {
            let labels = self.keys.parse(&container.labels);
            if labels.dns_server && server.is_none() {
                let Some(network) = labels.dns_network else {
                    warn!("DNS server {} has no dns.network label", container);
                    continue;
                };
                let network = self.config.network_name(&network);
                let detail = self.engine.inspect_container(&container.id).await?;
                match detail.networks.get(&network).and_then(|n| n.ipv4.clone()) {
                    Some(ip) => server = Some((network, ip)),
                    None => warn!("DNS server {} has no address on {}", container, network),
                }
            }
            if labels.dns_api && mgmt_host.is_none() {
                let detail = self.engine.inspect_container(&container.id).await?;
                mgmt_host = Some(detail.hostname);
            }
        }

        match (server, mgmt_host) {
            (Some((network, resolver_ip)), Some(mgmt_host)) => Ok(DnsTarget {
                network,
                resolver_ip,
                mgmt_host,
            }),
            (None, _) => Err(OperatorError::Discovery("no DNS server container".into())),
            (_, None) => Err(OperatorError::Discovery(
                "no DNS management container".into(),
            )),
        }
    }

    /// Discovers the DNS service and enables publishing.
    pub async fn discover_dns(&self) -> Result<()> {
        let target = self.locate_dns().await?;
        self.install_dns(target).await
    }

    /// Tries discovery again if an earlier attempt failed.
    pub(crate) async fn ensure_dns(&self) {
        if self.dns_publisher().await.is_some() {
            return;
        }
        if let Err(e) = self.discover_dns().await {
            warn!("DNS discovery failed: {}", e);
        }
    }

    /// Recreates `dns.required` containers whose resolvers do not start with
    /// the discovered DNS server.
    pub async fn apply_dns_resolvers(&self) -> Result<()> {
        let Some(publisher) = self.dns_publisher().await else {
            return Err(OperatorError::Discovery(
                "no DNS server discovered yet".into(),
            ));
        };
        let resolver = publisher.target().resolver_ip.clone();

        for container in self.engine.list_containers().await? {
            if !self.keys.parse(&container.labels).dns_required {
                continue;
            }
            let detail = self.engine.inspect_container(&container.id).await?;
            let current = detail.host_config.dns.unwrap_or_default();
            if current.first() == Some(&resolver) {
                continue;
            }
            info!("Pointing {} at DNS server {}", container, resolver);
            if let Err(e) = self.recreate(&container.id).await {
                error!("Setting DNS for {} failed: {}", container, e);
            }
        }
        Ok(())
    }
}
