//! Error taxonomy for the deployment pipeline.

use crate::Network;

/// Errors surfaced by the deployment pipeline.
///
/// Configuration and validation errors are always raised before any subprocess
/// is spawned. Subprocess errors only abort the network they happened on.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// A required field is missing or malformed for the active destination.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The request itself is not allowed (unknown network, multi-network remote run...).
    #[error("validation error: {0}")]
    Validation(String),

    /// The deployment tool exited with a non-zero status.
    #[error("network={network}: script {script} failed with {}", exit_label(.code))]
    Subprocess {
        network: Network,
        script: String,
        code: Option<i32>,
    },

    /// A liveness probe failed. Only ever observed by the retry loop.
    #[error("rpc probe failed: {0}")]
    Probe(String),

    /// One or more networks failed during a fan-out.
    #[error("{} network(s) failed: {}", .0.len(), summarize(.0))]
    Networks(Vec<(Network, DeployError)>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn summarize(failures: &[(Network, DeployError)]) -> String {
    failures
        .iter()
        .map(|(network, err)| format!("[{network}] {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
