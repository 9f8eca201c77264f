//! Container label contract.
//!
//! Containers opt into operator behaviour through namespaced labels
//! (`<ns>.update`, `<ns>.dns.zone`, ...). [`LabelKeys`] owns the concrete
//! key strings for a namespace and parses a raw label map into a typed
//! [`ContainerLabels`] once, so the rest of the operator never matches on
//! key prefixes itself.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::warn;

/// Label recording the image id a replacement was created from.
pub const COMPOSE_IMAGE_LABEL: &str = "com.docker.compose.image";

/// DNS record kinds a container can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Aaaa,
    Cname,
    Txt,
}

impl RecordKind {
    /// Whether modifying a record of this kind requires a TXT audit entry.
    pub fn is_audited(self) -> bool {
        !matches!(self, RecordKind::Txt)
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(RecordKind::A),
            "aaaa" => Ok(RecordKind::Aaaa),
            "cname" => Ok(RecordKind::Cname),
            "txt" => Ok(RecordKind::Txt),
            other => Err(format!("unknown dns record kind `{}`", other)),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            RecordKind::A => "A",
            RecordKind::Aaaa => "AAAA",
            RecordKind::Cname => "CNAME",
            RecordKind::Txt => "TXT",
        };
        f.write_str(kind)
    }
}

/// A location inside a zone together with the record kind to publish there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsKey {
    pub location: String,
    pub kind: RecordKind,
}

/// Typed view of the operator labels on one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLabels {
    pub update: bool,
    pub dns_server: bool,
    pub dns_api: bool,
    pub dns_network: Option<String>,
    pub dns_required: bool,
    pub dns_zone: Option<String>,
    pub dns_keys: Vec<DnsKey>,
    pub driver: bool,
    pub with_drivers: bool,
}

/// Concrete label keys for one namespace.
#[derive(Debug, Clone)]
pub struct LabelKeys {
    pub update: String,
    pub dns_server: String,
    pub dns_api: String,
    pub dns_network: String,
    pub dns_required: String,
    pub dns_zone: String,
    dns_key_prefix: String,
    pub driver: String,
    pub with_drivers: String,
    pub depends_on_drivers: String,
}

impl LabelKeys {
    pub fn new(namespace: &str) -> Self {
        let ns = namespace.trim_end_matches('.');
        let key = |suffix: &str| format!("{}.{}", ns, suffix);
        Self {
            update: key("update"),
            dns_server: key("dns.server"),
            dns_api: key("dns.api"),
            dns_network: key("dns.network"),
            dns_required: key("dns.required"),
            dns_zone: key("dns.zone"),
            dns_key_prefix: key("dns.key."),
            driver: key("driver"),
            with_drivers: key("with-drivers"),
            depends_on_drivers: key("depends-on-drivers"),
        }
    }

    pub fn parse(&self, labels: &HashMap<String, String>) -> ContainerLabels {
        let flag = |key: &str| labels.get(key).map(|v| is_set(v)).unwrap_or(false);
        let value = |key: &str| {
            labels
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut dns_keys = Vec::new();
        for (key, locations) in labels {
            let Some(kind) = key.strip_prefix(&self.dns_key_prefix) else {
                continue;
            };
            let kind = match kind.parse::<RecordKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!("Ignoring label {}: {}", key, e);
                    continue;
                }
            };
            for location in locations.split(',').map(str::trim) {
                if !location.is_empty() {
                    dns_keys.push(DnsKey {
                        location: location.to_string(),
                        kind,
                    });
                }
            }
        }
        // HashMap iteration order is arbitrary.
        dns_keys.sort_by_key(|k| (k.location.clone(), k.kind.to_string()));

        ContainerLabels {
            update: flag(&self.update),
            dns_server: flag(&self.dns_server),
            dns_api: flag(&self.dns_api),
            dns_network: value(&self.dns_network),
            dns_required: flag(&self.dns_required),
            dns_zone: value(&self.dns_zone),
            dns_keys,
            driver: flag(&self.driver),
            with_drivers: flag(&self.with_drivers) || flag(&self.depends_on_drivers),
        }
    }
}

fn is_set(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "false" | "0")
}
