//! Error types shared by the operator subsystems.
//!
//! Each external collaborator gets its own error enum ([`EngineError`] for
//! the container engine, [`DnsError`] for the DNS management service,
//! [`DescriptorError`] for the compose descriptor). [`OperatorError`] wraps
//! them for the reconciliation code, which logs and carries on.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("engine error: {0}")]
    Other(String),
}

/// Failure talking to the DNS management service.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns management rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("dns management endpoint invalid: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid authorization token")]
    InvalidToken,
}

/// Failure reading the service descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse service descriptor: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Point in a replacement at which it failed after the old container
/// was already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStage {
    Create,
    Start,
    Register,
}

impl fmt::Display for ReplaceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            ReplaceStage::Create => "create",
            ReplaceStage::Start => "start",
            ReplaceStage::Register => "register",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("no service in descriptor matches image {0}")]
    NoService(String),

    #[error("image {0} has no repository tags")]
    NoImageTag(String),

    #[error("pulling {0} failed with every configured credential")]
    PullFailed(String),

    /// The old container was removed but its successor is not running.
    #[error(
        "replacement of {container} failed at {stage} after the old container was removed: {source}"
    )]
    Partial {
        container: String,
        stage: ReplaceStage,
        #[source]
        source: EngineError,
    },

    /// Some desired networks could not be joined after a swap.
    #[error("connecting {container} to {} failed", .networks.join(", "))]
    Reattach {
        container: String,
        networks: Vec<String>,
    },
}

pub type Result<T, E = OperatorError> = std::result::Result<T, E>;
