//! Sandbox stack control through `docker compose`.
//!
//! The sandbox is one shared compose project plus one project per network
//! (`<project>-<network>`), each running a local chain and an Otterscan explorer.

use std::path::PathBuf;

use anyhow::Context;
use futures::future::try_join_all;
use strum::{Display, EnumString};
use tokio::process::Command;

use crate::{
    Destination, EnvBag, Network,
    config::{OTTERSCAN_PORT, RPC_PORT, ResolvedConfig},
    settings::ComposeSettings,
};

pub const COMPOSE_PROJECT_NAME: &str = "COMPOSE_PROJECT_NAME";
pub const OTTERSCAN_CONFIG: &str = "OTTERSCAN_CONFIG";

/// Operation on the sandbox stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ComposeAction {
    /// Build and start every service in the background.
    Up,
    /// Stop and remove the containers, keeping volumes.
    Down,
    /// Stop and remove the containers and their volumes.
    DownClean,
    /// `down-clean` followed by `up`.
    Recreate,
}

impl ComposeAction {
    /// Orchestrator arguments after `compose`. Empty for [`ComposeAction::Recreate`].
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            ComposeAction::Up => &["up", "--build", "--remove-orphans", "-d"],
            ComposeAction::Down => &["down", "--remove-orphans"],
            ComposeAction::DownClean => &["down", "--remove-orphans", "--volumes"],
            ComposeAction::Recreate => &[],
        }
    }

    /// Primitive actions this one is made of.
    pub fn phases(&self) -> Vec<ComposeAction> {
        match self {
            ComposeAction::Recreate => vec![ComposeAction::DownClean, ComposeAction::Up],
            other => vec![*other],
        }
    }
}

/// One `docker compose` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInvocation {
    pub action: ComposeAction,
    pub project: String,
    pub dir: PathBuf,
    /// Variables layered over the inherited environment.
    pub env: EnvBag,
    /// Set for per-network projects.
    pub network: Option<Network>,
}

/// Otterscan runtime configuration for a network's explorer.
pub fn otterscan_config(network: Network, rpc_port: u16, scanner_base_url: &str) -> serde_json::Value {
    serde_json::json!({
        // Otterscan runs in the browser, so it needs the host port.
        "erigonURL": format!("http://localhost:{rpc_port}"),
        "beaconAPI": "",
        "assetsURLPrefix": "",
        "experimental": "",
        "branding": {
            "siteName": format!("{network} {scanner_base_url}"),
            "networkTitle": network.to_string(),
        },
        "sourcifySources": {
            "ipfs": "https://ipfs.io/ipns/repo.sourcify.dev",
            "central_server": "http://sourcify:5555/verify",
        },
    })
}

/// Controls the sandbox compose projects.
#[derive(Debug, Clone)]
pub struct Compose {
    settings: ComposeSettings,
}

impl Compose {
    pub fn new(settings: ComposeSettings) -> Self {
        Self { settings }
    }

    /// Environment of a network's compose project.
    pub fn network_env(&self, config: &ResolvedConfig) -> EnvBag {
        let rpc_port = config.rpc_url.port_or_known_default().unwrap_or_default();
        let otterscan_port = config
            .scanner_base_url
            .port_or_known_default()
            .unwrap_or_default();
        let scanner = config.scanner_base_url.as_str().trim_end_matches('/');

        config
            .section
            .scalars()
            .with(RPC_PORT, rpc_port.to_string())
            .with(OTTERSCAN_PORT, otterscan_port.to_string())
            .with("NX_VERBOSE_LOGGING", "true")
            .with(
                COMPOSE_PROJECT_NAME,
                format!("{}-{}", self.settings.project, config.network),
            )
            .with(
                OTTERSCAN_CONFIG,
                otterscan_config(config.network, rpc_port, scanner).to_string(),
            )
    }

    /// Calls needed for `action`: per phase, the shared project then every network.
    pub fn plan(&self, action: ComposeAction, configs: &[ResolvedConfig]) -> Vec<Vec<ComposeInvocation>> {
        action
            .phases()
            .into_iter()
            .flat_map(|phase| {
                let shared = vec![ComposeInvocation {
                    action: phase,
                    project: self.settings.project.clone(),
                    dir: self.settings.shared_dir.clone(),
                    env: EnvBag::new().with(COMPOSE_PROJECT_NAME, self.settings.project.clone()),
                    network: None,
                }];
                let networks = configs
                    .iter()
                    .map(|config| ComposeInvocation {
                        action: phase,
                        project: format!("{}-{}", self.settings.project, config.network),
                        dir: self.settings.network_dir.clone(),
                        env: self.network_env(config),
                        network: Some(config.network),
                    })
                    .collect();
                [shared, networks]
            })
            .collect()
    }

    /// Apply `action` to the sandbox stack. Other destinations are left untouched.
    ///
    /// Batches run in order; the calls of a batch run concurrently.
    pub async fn apply(
        &self,
        action: ComposeAction,
        destination: Destination,
        configs: &[ResolvedConfig],
    ) -> anyhow::Result<()> {
        if destination != Destination::Sandbox {
            tracing::warn!(%destination, %action, "Compose only manages the sandbox, nothing to do");
            return Ok(());
        }

        for batch in self.plan(action, configs) {
            try_join_all(batch.iter().map(|invocation| self.run(invocation))).await?;
        }
        Ok(())
    }

    async fn run(&self, invocation: &ComposeInvocation) -> anyhow::Result<()> {
        tracing::info!(
            project = %invocation.project,
            dir = %invocation.dir.display(),
            action = %invocation.action,
            "Running docker compose"
        );

        let status = Command::new(&self.settings.binary)
            .arg("compose")
            .args(invocation.action.args())
            .current_dir(&invocation.dir)
            .envs(invocation.env.iter())
            .status()
            .await
            .with_context(|| {
                format!(
                    "Failed to start {} compose in {}",
                    self.settings.binary,
                    invocation.dir.display()
                )
            })?;

        if !status.success() {
            anyhow::bail!(
                "{} compose {} failed for project {} ({})",
                self.settings.binary,
                invocation.action,
                invocation.project,
                status
            );
        }

        if let (ComposeAction::Up, Some(network), Some(port)) = (
            invocation.action,
            invocation.network,
            invocation.env.get(OTTERSCAN_PORT),
        ) {
            tracing::info!(%network, "Otterscan running under http://localhost:{port}");
        }
        Ok(())
    }
}
