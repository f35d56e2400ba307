//! forgecast runs Foundry deployment scripts across local sandbox, dev and production chains.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, ComposeArgs, DeployAllArgs, DeployArgs, FundArgs, StateArgs, TargetArgs};
use forgecast_deploy::{
    ArtifactMap, Compose, ComposeAction, DeployRequest, DeployedState, Destination, Executor,
    ForgeRunner, LogSink, Network, Pipeline, ResolvedConfig, RpcProbe, Settings, StateStore,
    StaticConfig,
    config::{ProcessEnv, resolve},
    executor::log_file_path,
    faucet,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let settings = Settings::load(&cli.settings)?;

    match cli.command {
        Command::Deploy(args) => deploy(settings, args).await,
        Command::DeployAll(args) => deploy_all(settings, args).await,
        Command::Compose(args) => compose(settings, args).await,
        Command::Fund(args) => fund(settings, args).await,
        Command::State(args) => show_state(&settings, args),
    }
}

fn process_env() -> ProcessEnv {
    std::env::vars().collect()
}

/// Build the pipeline, mirroring tool output into a fresh log file.
fn pipeline(
    settings: Settings,
    command: &str,
    script: &str,
) -> Result<Pipeline<ForgeRunner, RpcProbe>> {
    let source = StaticConfig::load_from_file(&settings.network_config)?;
    let sink = LogSink::file(log_file_path(&settings.logs_dir, command, script));
    let executor = Executor::new(
        ForgeRunner::new(settings.tool.clone(), settings.workdir.clone()),
        sink,
    )
    .with_artifacts(settings.artifacts, settings.workdir.clone());

    Ok(Pipeline::new(executor, RpcProbe::new()?, settings)
        .with_static_config(source)
        .with_process_env(process_env()))
}

/// Resolve the sandbox config of each network, ignoring deployed state.
fn sandbox_configs(settings: &Settings, networks: &[Network]) -> Result<Vec<ResolvedConfig>> {
    let source = StaticConfig::load_from_file(&settings.network_config)?;
    let env = process_env();
    networks
        .iter()
        .map(|&network| {
            resolve(
                network,
                Destination::Sandbox,
                &ArtifactMap::default(),
                &source,
                &env,
                settings,
            )
            .map_err(anyhow::Error::from)
        })
        .collect()
}

fn networks(target: &TargetArgs) -> Result<Vec<Network>> {
    Ok(Network::parse_list(&target.network)?)
}

async fn deploy(settings: Settings, args: DeployArgs) -> Result<()> {
    let request = DeployRequest::script(
        args.script.clone(),
        args.iterator,
        args.target.destination,
        networks(&args.target)?,
    )
    .with_clear_prefixes(args.clear_prefix)
    .with_force(args.force);

    let pipeline = pipeline(settings, "deploy", &args.script)?;
    let state = pipeline.deploy(&request).await?;
    print_state(&state, &request.networks);
    Ok(())
}

async fn deploy_all(settings: Settings, args: DeployAllArgs) -> Result<()> {
    let destination = args.target.destination;
    let request = DeployRequest::plan(&settings.plan, destination, networks(&args.target)?)
        .with_force(args.force);

    let compose = Compose::new(settings.compose.clone());
    let configs = match destination {
        Destination::Sandbox => sandbox_configs(&settings, &request.networks)?,
        _ => Vec::new(),
    };
    let pipeline = pipeline(settings, "deploy-all", "plan")?;
    pipeline.preflight(&request)?;

    if destination == Destination::Sandbox {
        compose
            .apply(ComposeAction::Up, destination, &configs)
            .await
            .context("Failed to bring up the sandbox stack")?;
    }

    let state = pipeline.deploy(&request).await?;
    print_state(&state, &request.networks);
    Ok(())
}

async fn compose(settings: Settings, args: ComposeArgs) -> Result<()> {
    let destination = args.target.destination;
    let selected = sandbox_configs(&settings, &networks(&args.target)?)?;
    let compose = Compose::new(settings.compose.clone());

    if args.action == ComposeAction::Recreate {
        // Tear down every network, not only the selected ones, before bringing the selection up.
        let all = sandbox_configs(&settings, &Network::all())?;
        compose
            .apply(ComposeAction::DownClean, destination, &all)
            .await?;
        compose.apply(ComposeAction::Up, destination, &selected).await?;
    } else {
        compose.apply(args.action, destination, &selected).await?;
    }
    Ok(())
}

async fn fund(settings: Settings, args: FundArgs) -> Result<()> {
    let config = sandbox_configs(&settings, &[args.network])?
        .pop()
        .context("No sandbox config resolved")?;

    let result = faucet::fund(&RpcProbe::new()?, &config.rpc_url, &args.address, args.amount).await?;

    println!("Transaction: {}", result.tx_hash);
    println!(
        "Balance of {} on {}: {}",
        args.address,
        args.network,
        faucet::format_balance(&result.balance)?
    );
    Ok(())
}

fn show_state(settings: &Settings, args: StateArgs) -> Result<()> {
    let store = StateStore::new(&settings.state_dir);
    let state = store.load(args.destination)?;
    if state.is_empty() {
        println!(
            "Nothing deployed on {} yet ({})",
            args.destination,
            store.path(args.destination).display()
        );
        return Ok(());
    }
    print_state(&state, &Network::all());
    Ok(())
}

fn state_table(state: &DeployedState, networks: &[Network]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Network", "Name", "Value"]);

    for network in networks {
        for (name, value) in state.network(*network).iter() {
            table.add_row(vec![network.to_string(), name.clone(), value.clone()]);
        }
    }
    table
}

fn print_state(state: &DeployedState, networks: &[Network]) {
    println!("{}", state_table(state, networks));
}
