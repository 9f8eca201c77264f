//! Driver-set monitoring.
//!
//! Driver containers (`driver` label) are reached by their dependents
//! through a `DRIVERS` environment variable baked in at creation time.
//! When the set of drivers changes, every dependent is recreated so the
//! variable is current.

use log::{error, info, warn};

use crate::error::Result;
use crate::operator::Operator;
use crate::types::DriverSet;

impl Operator {
    /// Observes the current driver set. Returns whether it changed.
    pub async fn check_drivers(&self) -> Result<bool> {
        let containers = self.engine.list_containers().await?;

        let mut endpoints = Vec::new();
        for container in containers
            .iter()
            .filter(|c| self.keys.parse(&c.labels).driver)
        {
            match self.engine.inspect_container(&container.id).await {
                Ok(detail) => {
                    endpoints.push(format!("{}:{}", detail.hostname, self.config.driver_port))
                }
                Err(e) => warn!("Inspecting driver {} failed: {}", container, e),
            }
        }
        let observed = DriverSet::new(endpoints);

        {
            let mut current = self.drivers.lock().await;
            if *current == observed {
                return Ok(false);
            }
            info!(
                "Driver set changed: [{}] -> [{}]",
                current.endpoints().join(" "),
                observed.endpoints().join(" ")
            );
            if observed.is_empty() {
                warn!("No driver containers running");
            }
            *current = observed;
        }

        for dependent in containers
            .iter()
            .filter(|c| self.keys.parse(&c.labels).with_drivers)
        {
            info!("Recreating {} for new driver set", dependent);
            if let Err(e) = self.recreate(&dependent.id).await {
                error!("Recreating {} failed: {}", dependent, e);
            }
        }
        Ok(true)
    }
}
