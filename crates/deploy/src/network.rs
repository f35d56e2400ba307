//! Target networks and deployment destinations.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DeployError;

/// A chain the pipeline is allowed to deploy to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    Ethereum,
    Sepolia,
    Cartio,
}

/// Local port pair used when a sandbox network does not declare its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxPorts {
    pub rpc: u16,
    pub otterscan: u16,
}

impl Network {
    /// All allowed networks, in declaration order.
    pub fn all() -> Vec<Network> {
        <Network as strum::IntoEnumIterator>::iter().collect()
    }

    /// Upper-cased name, used as the env-key scope prefix (`ETHEREUM__FOO`).
    pub fn env_prefix(&self) -> String {
        self.as_ref().to_uppercase()
    }

    /// Default sandbox ports, matching the compose definitions shipped with the contracts.
    pub fn default_sandbox_ports(&self) -> SandboxPorts {
        match self {
            Network::Ethereum => SandboxPorts {
                rpc: 8546,
                otterscan: 28546,
            },
            Network::Sepolia => SandboxPorts {
                rpc: 8547,
                otterscan: 28547,
            },
            Network::Cartio => SandboxPorts {
                rpc: 8548,
                otterscan: 28548,
            },
        }
    }

    /// Parse a comma separated list of networks, rejecting anything outside the allow-list.
    pub fn parse_list(value: &str) -> Result<Vec<Network>, DeployError> {
        let mut networks = Vec::new();
        for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let network = Network::from_str(raw).map_err(|_| {
                DeployError::validation(format!(
                    "Invalid network: {raw}. Allowed values are: {}",
                    allowed_list()
                ))
            })?;
            if !networks.contains(&network) {
                networks.push(network);
            }
        }
        if networks.is_empty() {
            return Err(DeployError::validation("No network selected"));
        }
        Ok(networks)
    }
}

fn allowed_list() -> String {
    Network::all()
        .iter()
        .map(Network::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Deployment environment class.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Destination {
    /// Local docker sandbox, one anvil per network on fixed local ports.
    #[default]
    #[strum(to_string = "sandbox", serialize = "docker")]
    #[serde(alias = "docker")]
    Sandbox,
    /// Hosted development chains.
    Dev,
    /// Live chains.
    Prod,
}

impl Destination {
    /// Whether several networks may be targeted by a single invocation.
    pub fn allows_fan_out(&self) -> bool {
        matches!(self, Destination::Sandbox)
    }

    /// Whether well-known test credentials may stand in for missing ones.
    pub fn allows_test_credentials(&self) -> bool {
        !matches!(self, Destination::Prod)
    }
}
