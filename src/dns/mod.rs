//! DNS record publication.
//!
//! Containers that carry a `dns.zone` label get their address written into
//! that zone on the DNS management service. The service owns the zone; each
//! publish fetches it, merges the container's records in place and writes it
//! back, so there is no local cache to go stale.
//!
//! Every change to an A, AAAA or CNAME entry is paired with a TXT entry
//! recording when the operator made it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};

use crate::error::DnsError;
use crate::labels::{DnsKey, RecordKind};

pub mod proto;

use proto::dns_client::DnsClient as ProtoDnsClient;
use proto::{record, Record, Zone};

pub const DEFAULT_TTL: i64 = 300;

/// Get/put access to zones on the DNS management service.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn get(&self, zone: &str) -> Result<Zone, DnsError>;

    async fn put(&self, zone: Zone) -> Result<i64, DnsError>;
}

/// [`DnsClient`] over gRPC.
pub struct GrpcDnsClient {
    client: ProtoDnsClient<Channel>,
    token: Option<MetadataValue<Ascii>>,
}

impl GrpcDnsClient {
    /// Creates a client for `host:port`. The channel connects on first use.
    pub fn new(host: &str, port: u16, token: Option<&str>) -> Result<Self, DnsError> {
        let channel = Endpoint::from_shared(format!("http://{}:{}", host, port))?.connect_lazy();
        let token: Option<MetadataValue<Ascii>> = token
            .map(|t| {
                format!("Bearer {}", t)
                    .parse()
                    .map_err(|_| DnsError::InvalidToken)
            })
            .transpose()?;
        Ok(Self {
            client: ProtoDnsClient::new(channel),
            token,
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(token) = &self.token {
            request
                .metadata_mut()
                .insert("authorization", token.clone());
        }
        request
    }
}

#[async_trait]
impl DnsClient for GrpcDnsClient {
    async fn get(&self, zone: &str) -> Result<Zone, DnsError> {
        let request = self.request(Zone {
            name: zone.to_string(),
            ..Default::default()
        });
        let response = self.client.clone().get(request).await?;
        Ok(response.into_inner())
    }

    async fn put(&self, zone: Zone) -> Result<i64, DnsError> {
        let response = self.client.clone().put(self.request(zone)).await?;
        Ok(response.into_inner().result)
    }
}

/// Where the DNS service lives, as discovered on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsTarget {
    /// Network the DNS server and published addresses live on.
    pub network: String,
    /// Address of the DNS server inside `network`.
    pub resolver_ip: String,
    /// Hostname of the management API container.
    pub mgmt_host: String,
}

/// Values one container contributes to its records.
#[derive(Debug, Clone, Default)]
pub struct RecordValues {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub hostname: String,
}

pub struct DnsPublisher {
    client: Arc<dyn DnsClient>,
    target: DnsTarget,
    ttl: i64,
}

impl DnsPublisher {
    pub fn new(client: Arc<dyn DnsClient>, target: DnsTarget, ttl: i64) -> Self {
        Self {
            client,
            target,
            ttl,
        }
    }

    pub fn target(&self) -> &DnsTarget {
        &self.target
    }

    /// Merges the records for `keys` into `zone` and writes it back.
    pub async fn publish(
        &self,
        zone: &str,
        values: &RecordValues,
        keys: &[DnsKey],
    ) -> Result<(), DnsError> {
        let mut current = self.client.get(zone).await?;
        if current.name.is_empty() {
            current.name = zone.to_string();
        }

        let now = Utc::now();
        let mut changed = 0;
        for key in keys {
            if apply(&mut current, key, values, self.ttl, now) {
                changed += 1;
            }
        }
        if changed == 0 {
            return Ok(());
        }

        let result = self.client.put(current).await?;
        info!(
            "Put {} DNS record(s) into zone {} (result {})",
            changed, zone, result
        );
        Ok(())
    }
}

/// Applies one key to `zone`. Returns false when the container has no value
/// for the record kind or the record already holds it.
fn apply(
    zone: &mut Zone,
    key: &DnsKey,
    values: &RecordValues,
    ttl: i64,
    now: DateTime<Utc>,
) -> bool {
    let record = zone.locations.entry(key.location.clone()).or_default();
    let changed = match key.kind {
        RecordKind::A => values
            .ipv4
            .as_ref()
            .map(|ip| set_last(&mut record.a, record::A { ip: ip.clone(), ttl })),
        RecordKind::Aaaa => values
            .ipv6
            .as_ref()
            .map(|ip| set_last(&mut record.aaaa, record::Aaaa { ip: ip.clone(), ttl })),
        RecordKind::Cname => (!values.hostname.is_empty()).then(|| {
            set_last(
                &mut record.cname,
                record::Cname {
                    host: values.hostname.clone(),
                    ttl,
                },
            )
        }),
        RecordKind::Txt => values.ipv4.as_ref().map(|ip| {
            let entry = record::Txt {
                text: ip.clone(),
                ttl,
            };
            if record.txt.contains(&entry) {
                false
            } else {
                record.txt.push(entry);
                true
            }
        }),
    };

    match changed {
        None => {
            warn!(
                "No value for {} record at {}.{}, skipping",
                key.kind, key.location, zone.name
            );
            false
        }
        Some(false) => false,
        Some(true) => {
            if key.kind.is_audited() {
                audit(record, key.kind, ttl, now);
            }
            true
        }
    }
}

/// Overwrites the last entry, or appends to an empty list. Returns whether
/// anything changed.
fn set_last<T: PartialEq>(entries: &mut Vec<T>, entry: T) -> bool {
    match entries.last_mut() {
        Some(last) if *last == entry => false,
        Some(last) => {
            *last = entry;
            true
        }
        None => {
            entries.push(entry);
            true
        }
    }
}

fn audit(record: &mut Record, kind: RecordKind, ttl: i64, now: DateTime<Utc>) {
    record.txt.push(record::Txt {
        text: format!("{} changed by fleet-operator at {}", kind, now.to_rfc3339()),
        ttl,
    });
}
