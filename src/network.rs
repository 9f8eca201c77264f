//! Network reattachment after a container swap.

use log::{error, info, warn};

use crate::error::{OperatorError, Result};
use crate::operator::Operator;
use crate::types::EndpointConfig;

impl Operator {
    /// Moves a container onto exactly the networks in `desired`.
    ///
    /// The container is disconnected from everything it is attached to and
    /// then connected to each desired network with the captured links and
    /// aliases, so containers resolving it by alias keep working. Its address
    /// has usually changed afterwards, so DNS is republished.
    ///
    /// A failed connect does not stop the remaining ones; the networks that
    /// could not be joined are reported together at the end.
    pub async fn reattach(
        &self,
        container_id: &str,
        desired: &[String],
        endpoints: &EndpointConfig,
    ) -> Result<()> {
        let networks = self.engine.list_networks().await?;
        let targets: Vec<_> = networks
            .iter()
            .filter(|n| desired.contains(&n.name))
            .collect();
        for name in desired {
            if !targets.iter().any(|n| &n.name == name) {
                warn!("Network {} not found, {} will not join it", name, container_id);
            }
        }

        let detail = self.engine.inspect_container(container_id).await?;
        for (name, attachment) in &detail.networks {
            let network = if attachment.network_id.is_empty() {
                name.as_str()
            } else {
                attachment.network_id.as_str()
            };
            if let Err(e) = self.engine.disconnect_network(network, container_id).await {
                warn!("Disconnecting {} from {} failed: {}", detail.name, name, e);
            }
        }

        let mut failed = Vec::new();
        for network in targets {
            match self
                .engine
                .connect_network(&network.id, container_id, endpoints)
                .await
            {
                Ok(()) => info!("Connected {} to network {}", detail.name, network.name),
                Err(e) => {
                    error!("Connecting {} to {} failed: {}", detail.name, network.name, e);
                    failed.push(network.name.clone());
                }
            }
        }

        self.publish_dns(container_id).await;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(OperatorError::Reattach {
                container: detail.name,
                networks: failed,
            })
        }
    }
}
