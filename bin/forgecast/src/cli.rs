use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use forgecast_deploy::{ComposeAction, Destination, Network, settings::SETTINGS_FILE};
use tracing::level_filters::LevelFilter;

/// Networks selected when `--network` is not given.
const DEFAULT_NETWORKS: &str = "ethereum,cartio";

#[derive(Parser)]
#[command(name = "forgecast")]
#[command(
    author,
    version,
    about = "Deploy smart contracts across sandbox, dev and production chains"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "FORGECAST_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the settings file.
    #[arg(long, global = true, env = "FORGECAST_SETTINGS", default_value = SETTINGS_FILE)]
    pub settings: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one deployment script on the selected networks.
    Deploy(DeployArgs),

    /// Bring up the sandbox stack (sandbox only), then run the configured deployment plan.
    DeployAll(DeployAllArgs),

    /// Control the sandbox stack: up, down, down-clean or recreate.
    Compose(ComposeArgs),

    /// Send ETH to an address from the first funded sandbox account.
    Fund(FundArgs),

    /// Print the deployed artifacts of a destination.
    State(StateArgs),
}

/// Where to deploy.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Deployment destination: sandbox (alias docker), dev or prod.
    #[arg(short, long, env = "FORGECAST_DESTINATION", default_value_t = Destination::Sandbox)]
    pub destination: Destination,

    /// Comma separated networks. Allowed values: ethereum, sepolia, cartio.
    ///
    /// Dev and prod accept a single network.
    #[arg(short, long, env = "FORGECAST_NETWORK", default_value = DEFAULT_NETWORKS)]
    pub network: String,
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Script name (resolved to `<scripts_dir>/<name>.s.sol`) or path to a `.sol` file.
    #[arg(short, long)]
    pub script: String,

    /// Config field listing per-instance overrides; the script runs once per element.
    ///
    /// Defaults to a field named after the script.
    #[arg(short, long)]
    pub iterator: Option<String>,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Env key prefix to clear (`<PREFIX>__KEY` becomes `KEY`). Repeatable, applied in order.
    #[arg(long = "clear-prefix")]
    pub clear_prefix: Vec<String>,

    /// Ignore previously deployed artifacts when building the script environment.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeployAllArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Ignore previously deployed artifacts when building the script environment.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ComposeArgs {
    /// The operation to run.
    pub action: ComposeAction,

    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args, Debug, Clone)]
pub struct FundArgs {
    /// Recipient address.
    #[arg(long)]
    pub address: String,

    /// Amount of ETH to send.
    #[arg(long)]
    pub amount: f64,

    /// Sandbox network to fund on.
    #[arg(short, long, default_value_t = Network::Ethereum)]
    pub network: Network,
}

#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// Destination whose registry is printed.
    #[arg(short, long, env = "FORGECAST_DESTINATION", default_value_t = Destination::Sandbox)]
    pub destination: Destination,
}
