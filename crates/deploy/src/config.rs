//! Per-network configuration: the static declarative source and the resolver
//! that turns it into a [`ResolvedConfig`] for one destination.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::{
    DeployError, Destination, EnvBag, Network, Settings, error::Result, state::ArtifactMap,
};

/// Well-known Anvil account #1 key, only ever used outside production.
pub const DEFAULT_TEST_PRIVATE_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

/// Anvil account #2, owner of every contract deployed outside production.
pub const DEFAULT_TEST_WALLET_ADDRESS: &str = "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC";

pub const RPC_PORT: &str = "RPC_PORT";
pub const OTTERSCAN_PORT: &str = "OTTERSCAN_PORT";
pub const RPC_URL: &str = "RPC_URL";
pub const SCANNER_BASE_URL: &str = "SCANNER_BASE_URL";
pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
pub const WALLET_ADDRESS: &str = "WALLET_ADDRESS";

/// One declared field of a network section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// A plain value, projected into the subprocess environment.
    Single(String),
    /// Ordered override maps, one tool invocation per element.
    Many(Vec<EnvBag>),
    /// Explicitly disabled on this network (`false` in TOML).
    Skip,
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FieldValue::Single(value) => Some(value),
            _ => None,
        }
    }
}

/// Scalar shapes accepted inside override maps.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl RawScalar {
    fn into_string(self) -> String {
        match self {
            RawScalar::Text(s) => s,
            RawScalar::Integer(i) => i.to_string(),
            RawScalar::Float(f) => f.to_string(),
            RawScalar::Flag(b) => b.to_string(),
        }
    }
}

/// Field shapes accepted in the static config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawField {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
    Overlays(Vec<BTreeMap<String, RawScalar>>),
}

impl From<RawField> for FieldValue {
    fn from(raw: RawField) -> Self {
        match raw {
            RawField::Text(s) => FieldValue::Single(s),
            RawField::Integer(i) => FieldValue::Single(i.to_string()),
            RawField::Float(f) => FieldValue::Single(f.to_string()),
            RawField::Flag(false) => FieldValue::Skip,
            RawField::Flag(true) => FieldValue::Single("true".to_string()),
            RawField::Overlays(items) => FieldValue::Many(
                items
                    .into_iter()
                    .map(|item| {
                        item.into_iter()
                            .map(|(k, v)| (k, v.into_string()))
                            .collect()
                    })
                    .collect(),
            ),
        }
    }
}

/// Declared fields of one network, as read from the static config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSection {
    pub fields: BTreeMap<String, FieldValue>,
}

impl NetworkSection {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn scalar(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_scalar)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    /// Scalar fields only, as a subprocess environment.
    pub fn scalars(&self) -> EnvBag {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.as_scalar().map(|v| (k.clone(), v.to_string())))
            .collect()
    }
}

impl<'de> Deserialize<'de> for NetworkSection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = BTreeMap::<String, RawField>::deserialize(deserializer)?;
        Ok(Self {
            fields: raw.into_iter().map(|(k, v)| (k, v.into())).collect(),
        })
    }
}

/// The static, declarative config source: one section per network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StaticConfig(BTreeMap<String, NetworkSection>);

impl StaticConfig {
    /// Load the network config file. A missing file yields an empty config.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Network config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read network config from {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse network config {}", path.display()))?;

        tracing::debug!(path = %path.display(), networks = config.0.len(), "Network config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid network config TOML")?;
        for name in config.0.keys() {
            Network::from_str(name).map_err(|_| {
                anyhow::anyhow!("Network config declares unknown network section [{name}]")
            })?;
        }
        Ok(config)
    }

    pub fn section(&self, network: Network) -> NetworkSection {
        self.0.get(network.as_ref()).cloned().unwrap_or_default()
    }

    pub fn insert(&mut self, network: Network, section: NetworkSection) {
        self.0.insert(network.to_string(), section);
    }
}

/// Credentials handed to the deployment tool.
#[derive(Clone)]
pub struct DeployerCredentials {
    pub private_key: String,
    /// Checksummed address derived from the private key.
    pub address: String,
    pub wallet_address: Address,
}

impl std::fmt::Debug for DeployerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployerCredentials")
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .field("wallet_address", &self.wallet_address)
            .finish()
    }
}

/// Fully resolved configuration of one network for one destination.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub network: Network,
    pub destination: Destination,
    pub rpc_url: Url,
    pub scanner_base_url: Url,
    pub credentials: DeployerCredentials,
    /// Static fields with prior deployment state layered over the scalars.
    pub section: NetworkSection,
}

impl ResolvedConfig {
    /// Base environment shared by every task on this network.
    pub fn base_env(&self) -> EnvBag {
        self.section
            .scalars()
            .with(RPC_URL, self.rpc_url.as_str().trim_end_matches('/'))
            .with(
                SCANNER_BASE_URL,
                self.scanner_base_url.as_str().trim_end_matches('/'),
            )
            .with(PRIVATE_KEY, self.credentials.private_key.clone())
            .with(WALLET_ADDRESS, self.credentials.wallet_address.to_string())
            .with("DESTINATION", self.destination.to_string())
    }
}

/// Snapshot of the process environment the resolver reads credentials from.
pub type ProcessEnv = BTreeMap<String, String>;

/// Resolve the configuration of `network` for `destination`.
///
/// `prior` is the network's persisted deployment state; its entries override
/// static scalar fields so scripts see what is already deployed.
pub fn resolve(
    network: Network,
    destination: Destination,
    prior: &ArtifactMap,
    source: &StaticConfig,
    process_env: &ProcessEnv,
    settings: &Settings,
) -> Result<ResolvedConfig> {
    let mut section = source.section(network);
    for (key, value) in prior.iter() {
        // Iterator and skipped fields keep their declared shape.
        if matches!(section.get(key), None | Some(FieldValue::Single(_))) {
            section.insert(key.clone(), FieldValue::Single(value.clone()));
        } else {
            tracing::debug!(%network, field = %key, "Deployed value shadows a non-scalar field, keeping the declared shape");
        }
    }

    let (rpc_url, scanner_base_url) = connection(network, destination, &section, settings)?;
    let credentials = credentials(destination, process_env)?;

    tracing::debug!(
        %network,
        %destination,
        %rpc_url,
        %scanner_base_url,
        deployer = %credentials.address,
        "Network config resolved"
    );

    Ok(ResolvedConfig {
        network,
        destination,
        rpc_url,
        scanner_base_url,
        credentials,
        section,
    })
}

fn connection(
    network: Network,
    destination: Destination,
    section: &NetworkSection,
    settings: &Settings,
) -> Result<(Url, Url)> {
    match destination {
        Destination::Sandbox => {
            let defaults = network.default_sandbox_ports();
            let rpc_port = port_field(section, RPC_PORT, defaults.rpc)?;
            let otterscan_port = port_field(section, OTTERSCAN_PORT, defaults.otterscan)?;
            Ok((
                parse_url(RPC_URL, &format!("http://localhost:{rpc_port}"))?,
                parse_url(
                    SCANNER_BASE_URL,
                    &format!("http://localhost:{otterscan_port}"),
                )?,
            ))
        }
        Destination::Dev => {
            let derived = settings.dev_domain.as_deref().map(|domain| {
                (
                    format!("https://{network}-rpc.{domain}"),
                    format!("https://{network}-otterscan.{domain}"),
                )
            });
            let rpc = section
                .scalar(RPC_URL)
                .map(str::to_string)
                .or_else(|| derived.as_ref().map(|d| d.0.clone()));
            let scanner = section
                .scalar(SCANNER_BASE_URL)
                .map(str::to_string)
                .or_else(|| derived.as_ref().map(|d| d.1.clone()));
            explicit_urls(network, destination, rpc, scanner)
        }
        Destination::Prod => explicit_urls(
            network,
            destination,
            section.scalar(RPC_URL).map(str::to_string),
            section.scalar(SCANNER_BASE_URL).map(str::to_string),
        ),
    }
}

fn explicit_urls(
    network: Network,
    destination: Destination,
    rpc: Option<String>,
    scanner: Option<String>,
) -> Result<(Url, Url)> {
    match (rpc, scanner) {
        (Some(rpc), Some(scanner)) => Ok((
            parse_url(RPC_URL, &rpc)?,
            parse_url(SCANNER_BASE_URL, &scanner)?,
        )),
        _ => Err(DeployError::configuration(format!(
            "network={network}: Missing {RPC_URL} or {SCANNER_BASE_URL} for destination {destination}"
        ))),
    }
}

fn port_field(section: &NetworkSection, key: &str, default: u16) -> Result<u16> {
    match section.scalar(key) {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            DeployError::configuration(format!("{key} must be a port number, got '{raw}'"))
        }),
        None => {
            tracing::debug!(key, default, "Port not configured, using sandbox default");
            Ok(default)
        }
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw)
        .map_err(|e| DeployError::configuration(format!("{key} is not a valid URL ('{raw}'): {e}")))
}

fn credentials(destination: Destination, process_env: &ProcessEnv) -> Result<DeployerCredentials> {
    let private_key = match process_env.get(PRIVATE_KEY) {
        Some(key) => key.clone(),
        None if destination.allows_test_credentials() => {
            tracing::debug!("{PRIVATE_KEY} not set, using the well-known test key");
            DEFAULT_TEST_PRIVATE_KEY.to_string()
        }
        None => {
            return Err(DeployError::configuration(format!(
                "Missing required deployer {PRIVATE_KEY} environment variable"
            )));
        }
    };

    let signer = PrivateKeySigner::from_str(&private_key).map_err(|_| {
        DeployError::configuration(format!("{PRIVATE_KEY} is not a valid secp256k1 private key"))
    })?;

    let wallet_address = match process_env.get(WALLET_ADDRESS) {
        Some(address) => address.clone(),
        None if destination.allows_test_credentials() => DEFAULT_TEST_WALLET_ADDRESS.to_string(),
        None => {
            return Err(DeployError::configuration(format!(
                "Missing required owner {WALLET_ADDRESS} environment variable to own all deployed contracts"
            )));
        }
    };
    let wallet_address = Address::from_str(&wallet_address).map_err(|_| {
        DeployError::configuration(format!(
            "{WALLET_ADDRESS} is not a valid address: '{wallet_address}'"
        ))
    })?;

    Ok(DeployerCredentials {
        private_key,
        address: signer.address().to_string(),
        wallet_address,
    })
}

/// Default location of the network config, relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("networks.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [ethereum]
        RPC_PORT = "9546"
        OTTERSCAN_PORT = 29546
        GRAPH_NODE_RPC_PORT = "8020"
        PointsFactory = false

        [[ethereum.DahliaPythOracle]]
        PYTH_ORACLE_BASE_TOKEN = "0x6969696969696969696969696969696969696969"
        PYTH_ORACLE_BASE_MAX_DELAY = 86400

        [[ethereum.DahliaPythOracle]]
        PYTH_ORACLE_BASE_TOKEN = "0x1da4dF975FE40dde074cBF19783928Da7246c515"
        PYTH_ORACLE_BASE_MAX_DELAY = 86400

        [sepolia]
        RPC_URL = "https://sepolia.example.org"
        SCANNER_BASE_URL = "https://sepolia-scan.example.org"
    "#;

    fn env(pairs: &[(&str, &str)]) -> ProcessEnv {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_field_shapes() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let section = config.section(Network::Ethereum);

        assert_eq!(section.scalar(OTTERSCAN_PORT), Some("29546"));
        assert_eq!(section.get("PointsFactory"), Some(&FieldValue::Skip));

        let Some(FieldValue::Many(items)) = section.get("DahliaPythOracle") else {
            panic!("expected an iterator field");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].get("PYTH_ORACLE_BASE_MAX_DELAY").map(String::as_str),
            Some("86400")
        );
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let err = StaticConfig::from_toml("[mainnet]\nRPC_PORT = \"1\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("unknown network section [mainnet]"));
    }

    #[test]
    fn test_sandbox_uses_local_ports() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let resolved = resolve(
            Network::Ethereum,
            Destination::Sandbox,
            &ArtifactMap::default(),
            &config,
            &ProcessEnv::new(),
            &Settings::default(),
        )
        .unwrap();

        assert_eq!(resolved.rpc_url.as_str(), "http://localhost:9546/");
        assert_eq!(resolved.scanner_base_url.as_str(), "http://localhost:29546/");
        assert_eq!(resolved.credentials.private_key, DEFAULT_TEST_PRIVATE_KEY);
    }

    #[test]
    fn test_sandbox_synthesizes_missing_ports() {
        let resolved = resolve(
            Network::Cartio,
            Destination::Sandbox,
            &ArtifactMap::default(),
            &StaticConfig::default(),
            &ProcessEnv::new(),
            &Settings::default(),
        )
        .unwrap();

        assert_eq!(resolved.rpc_url.as_str(), "http://localhost:8548/");
        assert_eq!(resolved.scanner_base_url.as_str(), "http://localhost:28548/");
    }

    #[test]
    fn test_prod_requires_explicit_urls() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let err = resolve(
            Network::Ethereum,
            Destination::Prod,
            &ArtifactMap::default(),
            &config,
            &env(&[(PRIVATE_KEY, DEFAULT_TEST_PRIVATE_KEY), (WALLET_ADDRESS, DEFAULT_TEST_WALLET_ADDRESS)]),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }

    #[test]
    fn test_prod_requires_private_key() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let err = resolve(
            Network::Sepolia,
            Destination::Prod,
            &ArtifactMap::default(),
            &config,
            &env(&[(WALLET_ADDRESS, DEFAULT_TEST_WALLET_ADDRESS)]),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains(PRIVATE_KEY));
    }

    #[test]
    fn test_prod_with_credentials_resolves() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let resolved = resolve(
            Network::Sepolia,
            Destination::Prod,
            &ArtifactMap::default(),
            &config,
            &env(&[
                (PRIVATE_KEY, "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"),
                (WALLET_ADDRESS, "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"),
            ]),
            &Settings::default(),
        )
        .unwrap();

        assert_eq!(resolved.rpc_url.as_str(), "https://sepolia.example.org/");
        assert_eq!(
            resolved.credentials.address,
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        );
    }

    #[test]
    fn test_invalid_private_key_is_a_config_error() {
        let err = resolve(
            Network::Ethereum,
            Destination::Sandbox,
            &ArtifactMap::default(),
            &StaticConfig::default(),
            &env(&[(PRIVATE_KEY, "not-a-key")]),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }

    #[test]
    fn test_dev_derives_urls_from_domain() {
        let settings = Settings {
            dev_domain: Some("example.dev".to_string()),
            ..Settings::default()
        };
        let resolved = resolve(
            Network::Cartio,
            Destination::Dev,
            &ArtifactMap::default(),
            &StaticConfig::default(),
            &ProcessEnv::new(),
            &settings,
        )
        .unwrap();
        assert_eq!(resolved.rpc_url.as_str(), "https://cartio-rpc.example.dev/");
        assert_eq!(
            resolved.scanner_base_url.as_str(),
            "https://cartio-otterscan.example.dev/"
        );
    }

    #[test]
    fn test_dev_without_urls_or_domain_fails() {
        let err = resolve(
            Network::Cartio,
            Destination::Dev,
            &ArtifactMap::default(),
            &StaticConfig::default(),
            &ProcessEnv::new(),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }

    #[test]
    fn test_prior_state_overrides_static_scalars() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let prior: ArtifactMap = [("GRAPH_NODE_RPC_PORT", "9020"), ("Dahlia", "0xdead")]
            .into_iter()
            .collect();
        let resolved = resolve(
            Network::Ethereum,
            Destination::Sandbox,
            &prior,
            &config,
            &ProcessEnv::new(),
            &Settings::default(),
        )
        .unwrap();

        let env = resolved.base_env();
        assert_eq!(env.get("GRAPH_NODE_RPC_PORT").map(String::as_str), Some("9020"));
        assert_eq!(env.get("Dahlia").map(String::as_str), Some("0xdead"));
        assert_eq!(env.get(RPC_URL).map(String::as_str), Some("http://localhost:9546"));
        assert_eq!(env.get("DESTINATION").map(String::as_str), Some("sandbox"));
        assert!(!env.contains_key("DahliaPythOracle"));
    }

    #[test]
    fn test_prior_state_keeps_iterator_and_skipped_fields() {
        let config = StaticConfig::from_toml(SAMPLE).unwrap();
        let prior: ArtifactMap = [("DahliaPythOracle", "0x01"), ("PointsFactory", "0x02")]
            .into_iter()
            .collect();
        let resolved = resolve(
            Network::Ethereum,
            Destination::Sandbox,
            &prior,
            &config,
            &ProcessEnv::new(),
            &Settings::default(),
        )
        .unwrap();

        assert!(matches!(
            resolved.section.get("DahliaPythOracle"),
            Some(FieldValue::Many(items)) if items.len() == 2
        ));
        assert_eq!(resolved.section.get("PointsFactory"), Some(&FieldValue::Skip));
    }
}
