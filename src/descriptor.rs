//! Service descriptor loading.
//!
//! Reads the docker-compose file the fleet was started from and resolves the
//! service definition for an image. Only the fields needed to recreate a
//! container are understood; everything else in the file is ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::DescriptorError;

#[derive(Debug, Default, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceDef {
    pub container_name: Option<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: KeyValues,
    #[serde(default)]
    pub environment: KeyValues,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Vec<Value>,
    #[serde(default)]
    pub networks: Networks,
    pub command: Option<Command>,
}

/// `KEY: value` maps or `KEY=value` lists.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum KeyValues {
    Map(BTreeMap<String, Option<Value>>),
    List(Vec<String>),
}

impl Default for KeyValues {
    fn default() -> Self {
        KeyValues::List(Vec::new())
    }
}

impl KeyValues {
    fn pairs(&self) -> Vec<(String, String)> {
        match self {
            KeyValues::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(scalar).unwrap_or_default()))
                .collect(),
            KeyValues::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Networks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Value>>),
}

impl Default for Networks {
    fn default() -> Self {
        Networks::List(Vec::new())
    }
}

impl Networks {
    fn names(&self) -> Vec<String> {
        match self {
            Networks::List(names) => names.clone(),
            Networks::Map(map) => map.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Args(Vec<String>),
}

/// Resolved configuration for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub service: String,
    pub container_name: Option<String>,
    pub image: String,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub env: Vec<String>,
    pub command: Option<Vec<String>>,
    pub networks: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ComposeFile {
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let text = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Finds the service whose image matches `image` by suffix, substituting
    /// `${VAR}` references through `lookup`.
    pub fn resolve<F>(&self, image: &str, lookup: F) -> Option<ServiceConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let wanted = normalize_image(image);
        let (name, def) = self.services.iter().find(|(_, def)| {
            if def.image.is_empty() {
                return false;
            }
            let declared = normalize_image(&def.image);
            declared.ends_with(&wanted) || wanted.ends_with(&declared)
        })?;

        let env = def
            .environment
            .pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, substitute(&v, &lookup)))
            .collect();
        let labels = def
            .labels
            .pairs()
            .into_iter()
            .map(|(k, v)| (k, substitute(&v, &lookup)))
            .collect();
        let command = def.command.as_ref().map(|c| match c {
            Command::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Command::Args(args) => args.clone(),
        });

        Some(ServiceConfig {
            service: name.clone(),
            container_name: def.container_name.clone(),
            image: def.image.clone(),
            ports: def.ports.iter().filter_map(exposed_port).collect(),
            volumes: def.volumes.clone(),
            env,
            command,
            networks: def.networks.names(),
            labels,
        })
    }
}

/// Appends the implicit `:latest` tag so `app` and `app:latest` match.
fn normalize_image(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Container side of a port mapping, e.g. `8080:80` -> `80/tcp`.
fn exposed_port(port: &Value) -> Option<String> {
    let spec = scalar(port);
    let container = spec.rsplit(':').next()?.trim();
    if container.is_empty() {
        return None;
    }
    if container.contains('/') {
        Some(container.to_string())
    } else {
        Some(format!("{}/tcp", container))
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Expands `${VAR}` and `${VAR:-default}`. Unterminated references are
/// kept verbatim.
pub fn substitute<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        let resolved = lookup(name).filter(|v| !v.is_empty() || default.is_none());
        out.push_str(&resolved.unwrap_or_else(|| default.unwrap_or_default().to_string()));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
