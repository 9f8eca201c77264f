//! Data structures used throughout the operator.
//!
//! These are plain values handed between the engine abstraction, the
//! registry and the replacement code. None of them hold engine handles.

use std::collections::HashMap;
use std::fmt;

use crate::runtime::NetworkAttachment;

/// A running container as known to the registry.
///
/// Records are never mutated in place; a recreated container gets a new
/// record under its new id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub short_id: String,
    pub names: Vec<String>,
    pub image: String,
    pub labels: HashMap<String, String>,
}

impl ContainerRecord {
    pub fn new(
        id: String,
        names: Vec<String>,
        image: String,
        labels: HashMap<String, String>,
    ) -> Self {
        let short_id = id.chars().take(12).collect();
        let names = names
            .into_iter()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();
        Self {
            id,
            short_id,
            names,
            image,
            labels,
        }
    }

    /// First display name, falling back to the short id.
    pub fn display_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.short_id)
    }
}

impl fmt::Display for ContainerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.display_name(), self.short_id, self.image)
    }
}

/// Links and aliases a container carried on its network attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointConfig {
    pub links: Vec<String>,
    pub aliases: Vec<String>,
}

impl EndpointConfig {
    /// Captures the endpoint settings of the first attachment.
    ///
    /// Docker adds the short container id as an alias on user networks; that
    /// alias would be wrong for the successor, so any alias that prefixes
    /// `container_id` is dropped.
    pub fn capture(networks: &HashMap<String, NetworkAttachment>, container_id: &str) -> Self {
        let mut names: Vec<&String> = networks.keys().collect();
        names.sort();
        let Some(attachment) = names.first().and_then(|n| networks.get(*n)) else {
            return Self::default();
        };
        let aliases = attachment
            .aliases
            .iter()
            .filter(|alias| !container_id.starts_with(alias.as_str()))
            .cloned()
            .collect();
        Self {
            links: attachment.links.clone(),
            aliases,
        }
    }
}

/// Sorted `host:port` endpoints of the driver containers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverSet(Vec<String>);

impl DriverSet {
    pub fn new(mut endpoints: Vec<String>) -> Self {
        endpoints.sort();
        Self(endpoints)
    }

    pub fn endpoints(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the `DRIVERS` environment variable.
    pub fn to_env(&self) -> String {
        format!("DRIVERS={}", self.0.join(" "))
    }
}

/// A replacement container that was created but did not start.
#[derive(Debug, Clone)]
pub struct PendingStart {
    pub container_id: String,
    pub name: String,
    pub networks: Vec<String>,
    pub endpoints: EndpointConfig,
}
