//! Tool-level settings, layered from defaults, `Forgecast.toml` and `FORGECAST_*` variables.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::default_config_path;

/// Default settings file, relative to the working directory.
pub const SETTINGS_FILE: &str = "Forgecast.toml";

/// Prefix of environment variables overriding settings (`FORGECAST_TOOL=...`).
pub const ENV_PREFIX: &str = "FORGECAST_";

/// Where deployed artifact names and values are read from after a script run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactSource {
    /// `NAME=VALUE` lines on the tool's stdout.
    #[default]
    Stdout,
    /// The tool's `broadcast/<script>/<chainId>/run-latest.json`, falling back to stdout.
    Broadcast,
}

/// Container orchestration of the local sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeSettings {
    /// Orchestrator binary, invoked as `<binary> compose ...`.
    pub binary: String,
    /// Compose project of the shared stack. Networks use `<project>-<network>`.
    pub project: String,
    /// Compose directory of the shared stack.
    pub shared_dir: PathBuf,
    /// Compose directory instantiated once per network.
    pub network_dir: PathBuf,
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            project: "dahlia".to_string(),
            shared_dir: PathBuf::from("./docker/dahlia/"),
            network_dir: PathBuf::from("./docker/dahlia-network/"),
        }
    }
}

/// One entry of the `deploy-all` plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub script: String,
    /// Iterator field, when the script is repeated per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<String>,
    /// Only run against the sandbox destination.
    #[serde(default)]
    pub sandbox_only: bool,
}

impl PlanStep {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            iterator: None,
            sandbox_only: false,
        }
    }

    pub fn sandbox_only(mut self) -> Self {
        self.sandbox_only = true;
        self
    }
}

/// The protocol deployment order used by `deploy-all` when none is configured.
pub fn default_plan() -> Vec<PlanStep> {
    let mut plan = vec![PlanStep::new("PointsFactory").sandbox_only()];
    plan.extend(
        [
            "ChainlinkWstETHToETH",
            "WrappedVaultImplementation",
            "DahliaRegistry",
            "IrmFactory",
            "VariableIrm",
            "Dahlia",
            "WrappedVaultFactory",
            "Timelock",
            "DahliaPythOracleFactory",
            "DahliaPythOracle",
            "WrappedVault",
            "DahliaRegistryTransfer",
        ]
        .into_iter()
        .map(PlanStep::new),
    );
    plan
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Deployment tool binary.
    pub tool: String,
    /// Working directory of the deployment tool (the contracts project root).
    pub workdir: PathBuf,
    /// Directory of deployment scripts, relative to `workdir`.
    pub scripts_dir: PathBuf,
    /// Per-network static config file.
    pub network_config: PathBuf,
    /// Directory holding `deployed.<destination>.json`.
    pub state_dir: PathBuf,
    /// Directory of per-run log files.
    pub logs_dir: PathBuf,
    /// Domain used to derive dev URLs (`https://<network>-rpc.<domain>`).
    pub dev_domain: Option<String>,
    pub artifacts: ArtifactSource,
    pub compose: ComposeSettings,
    pub plan: Vec<PlanStep>,
    /// Config field recorded into state next to `CHAIN_ID` once a network is ready.
    pub graph_node_field: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tool: "forge".to_string(),
            workdir: PathBuf::from(".."),
            scripts_dir: PathBuf::from("script"),
            network_config: default_config_path(),
            state_dir: PathBuf::from("./deployments"),
            logs_dir: PathBuf::from("./logs"),
            dev_domain: None,
            artifacts: ArtifactSource::default(),
            compose: ComposeSettings::default(),
            plan: default_plan(),
            graph_node_field: "GRAPH_NODE_RPC_PORT".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, then `path` (if it exists), then the environment.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Settings file not found, using defaults");
        }

        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        tracing::debug!(
            tool = %settings.tool,
            workdir = %settings.workdir.display(),
            artifacts = %settings.artifacts,
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Save settings as TOML.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize settings to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Settings saved");
        Ok(())
    }
}
