use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::RegistryAuth;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Seconds between full reconciliation passes.
    pub interval_secs: u64,
    pub compose_file: PathBuf,
    /// Prefix compose puts in front of network names (`<project>_`).
    pub compose_prefix: String,
    pub label_namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,
    pub docker_timeout_secs: u64,
    pub registries: Vec<RegistryAuth>,
    /// Fallback resolvers placed after the discovered DNS server.
    pub dns: Vec<String>,
    pub dns_mgmt_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_token: Option<String>,
    pub dns_ttl: i64,
    pub driver_port: u16,
    /// How long to wait at startup for the compose services; 0 disables.
    pub startup_wait_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            compose_file: PathBuf::from("./docker-compose.yml"),
            compose_prefix: String::new(),
            label_namespace: "nocloud".into(),
            docker_socket: None,
            docker_timeout_secs: 120,
            registries: Vec::new(),
            dns: Vec::new(),
            dns_mgmt_port: 8000,
            dns_token: None,
            dns_ttl: crate::dns::DEFAULT_TTL,
            driver_port: 8080,
            startup_wait_secs: 300,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("operator.toml"))
            .merge(Json::file("operator.json"))
            .merge(Yaml::file("operator-config.yml"))
            .merge(Env::prefixed("OPERATOR_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Unprefixed variables used by existing deployments
        if let Ok(port) = std::env::var("DRIVER_PORT") {
            config.driver_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid DRIVER_PORT: {}", e))?;
        }
        if let Ok(port) = std::env::var("DNS_MGMT_PORT") {
            config.dns_mgmt_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid DNS_MGMT_PORT: {}", e))?;
        }

        if config.interval_secs == 0 {
            anyhow::bail!("interval_secs must be greater than zero");
        }

        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Engine-side name of a compose network.
    pub fn network_name(&self, network: &str) -> String {
        format!("{}{}", self.compose_prefix, network)
    }
}
