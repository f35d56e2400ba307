//! Network fan-out controller.
//!
//! A [`Pipeline`] takes a [`DeployRequest`] (ordered steps, a destination and
//! the selected networks) and drives it to completion:
//!
//! 1. the request is validated and every network config is resolved before any
//!    subprocess is spawned,
//! 2. each network waits for its RPC, records `CHAIN_ID`, then runs the steps in
//!    order, expanding iterator fields into one tool invocation per element,
//! 3. state is flushed after every invocation so a failure never loses what was
//!    already deployed.
//!
//! Sandbox networks run concurrently. Remote destinations accept a single network.

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::{
    DeployError, Destination, EnvBag, Network, Settings,
    config::{ProcessEnv, ResolvedConfig, StaticConfig, resolve},
    env::clear_prefixes,
    error::Result,
    executor::{DeploymentTask, Executor, ScriptRunner, resolve_script_path},
    iteration::expand,
    rpc::{LivenessProbe, await_ready},
    settings::PlanStep,
    state::{ArtifactMap, DeployedState, StateStore},
};

/// State key holding the chain id reported by the readiness probe.
pub const CHAIN_ID: &str = "CHAIN_ID";

/// What to deploy, where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Steps run in order on every network.
    pub steps: Vec<PlanStep>,
    pub destination: Destination,
    pub networks: Vec<Network>,
    /// Extra prefixes cleared from env keys, after the network's own.
    pub clear_prefixes: Vec<String>,
    /// Ignore previously deployed artifacts when building the environment.
    pub force: bool,
}

impl DeployRequest {
    /// A single script, optionally repeated over an iterator field.
    pub fn script(
        script: impl Into<String>,
        iterator: Option<String>,
        destination: Destination,
        networks: Vec<Network>,
    ) -> Self {
        Self {
            steps: vec![PlanStep {
                script: script.into(),
                iterator,
                sandbox_only: false,
            }],
            destination,
            networks,
            clear_prefixes: Vec::new(),
            force: false,
        }
    }

    /// A full plan. Sandbox-only steps are dropped for remote destinations.
    pub fn plan(steps: &[PlanStep], destination: Destination, networks: Vec<Network>) -> Self {
        let steps = steps
            .iter()
            .filter(|step| destination == Destination::Sandbox || !step.sandbox_only)
            .cloned()
            .collect();
        Self {
            steps,
            destination,
            networks,
            clear_prefixes: Vec::new(),
            force: false,
        }
    }

    pub fn with_clear_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.clear_prefixes = prefixes;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Reject requests that must never reach a subprocess.
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(DeployError::validation("No network selected"));
        }
        if !self.destination.allows_fan_out() && self.networks.len() > 1 {
            return Err(DeployError::validation(format!(
                "Please specify a single --network when using --destination {} (got {})",
                self.destination,
                self.networks
                    .iter()
                    .map(Network::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            )));
        }
        Ok(())
    }
}

/// Drives deployment requests across networks.
#[derive(Debug)]
pub struct Pipeline<R, P> {
    executor: Executor<R>,
    probe: P,
    store: StateStore,
    source: StaticConfig,
    settings: Settings,
    process_env: ProcessEnv,
}

impl<R, P> Pipeline<R, P>
where
    R: ScriptRunner,
    P: LivenessProbe,
{
    /// Create a pipeline storing state under `settings.state_dir`, with an
    /// empty static config and process environment.
    pub fn new(executor: Executor<R>, probe: P, settings: Settings) -> Self {
        Self {
            executor,
            probe,
            store: StateStore::new(&settings.state_dir),
            source: StaticConfig::default(),
            settings,
            process_env: ProcessEnv::new(),
        }
    }

    pub fn with_static_config(mut self, source: StaticConfig) -> Self {
        self.source = source;
        self
    }

    pub fn with_process_env(mut self, process_env: ProcessEnv) -> Self {
        self.process_env = process_env;
        self
    }

    pub fn executor(&self) -> &Executor<R> {
        &self.executor
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Validate `request` and resolve every selected network without touching
    /// the filesystem.
    pub fn preflight(&self, request: &DeployRequest) -> Result<()> {
        request.validate()?;
        let state = self.store.load(request.destination)?;
        self.resolve_all(request, &state).map(|_| ())
    }

    fn resolve_all(&self, request: &DeployRequest, state: &DeployedState) -> Result<Vec<ResolvedConfig>> {
        request
            .networks
            .iter()
            .map(|&network| {
                let prior = if request.force {
                    ArtifactMap::default()
                } else {
                    state.network(network)
                };
                resolve(
                    network,
                    request.destination,
                    &prior,
                    &self.source,
                    &self.process_env,
                    &self.settings,
                )
            })
            .collect()
    }

    /// Run `request` and return the destination's state once every network is done.
    ///
    /// Configuration errors abort before the run lock is taken. Per-network
    /// failures are collected into [`DeployError::Networks`] after all networks
    /// finished; state recorded until the failure is persisted.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployedState> {
        self.preflight(request)?;
        let destination = request.destination;

        let _lock = self.store.lock(destination)?;
        // Reload under the lock, a previous run may have finished in between.
        let state = self.store.load(destination)?;
        let configs = self.resolve_all(request, &state)?;

        tracing::info!(
            %destination,
            networks = configs.len(),
            steps = request.steps.len(),
            force = request.force,
            "Starting deployment"
        );

        let state = Mutex::new(state);
        let shared = &state;

        let outcomes = if destination.allows_fan_out() {
            join_all(configs.iter().map(|config| async move {
                (config.network, self.run_network(config, request, shared).await)
            }))
            .await
        } else {
            let mut outcomes = Vec::with_capacity(configs.len());
            for config in &configs {
                outcomes.push((config.network, self.run_network(config, request, shared).await));
            }
            outcomes
        };

        let state = state.into_inner();
        self.store.save(destination, &state)?;

        let failures: Vec<_> = outcomes
            .into_iter()
            .filter_map(|(network, outcome)| outcome.err().map(|err| (network, err)))
            .collect();

        if failures.is_empty() {
            tracing::info!(%destination, path = %self.store.path(destination).display(), "Deployment complete");
            Ok(state)
        } else {
            for (network, err) in &failures {
                tracing::error!(%network, error = %err, "Deployment failed on network");
            }
            Err(DeployError::Networks(failures))
        }
    }

    async fn run_network(
        &self,
        config: &ResolvedConfig,
        request: &DeployRequest,
        state: &Mutex<DeployedState>,
    ) -> Result<()> {
        let network = config.network;
        tracing::info!(
            %network,
            rpc_url = %config.rpc_url,
            deployer = %config.credentials.address,
            "Waiting for RPC"
        );
        let chain_id = await_ready(&self.probe, &config.rpc_url).await;

        // Artifacts produced during this run, visible to later steps.
        let mut produced = EnvBag::new().with(CHAIN_ID, chain_id.to_string());
        {
            let mut state = state.lock().await;
            state.record(network, CHAIN_ID, chain_id.to_string());
            let field = &self.settings.graph_node_field;
            if let Some(port) = config.section.scalar(field) {
                state.record(network, field.clone(), port);
            }
        }
        self.flush(request.destination, state).await?;

        let prefixes: Vec<String> = std::iter::once(network.env_prefix())
            .chain(request.clear_prefixes.iter().cloned())
            .collect();

        for step in &request.steps {
            let iterations = expand(&config.section, &step.script, step.iterator.as_deref());
            if iterations.is_empty() {
                tracing::info!(%network, script = %step.script, "Step disabled on this network, skipping");
                continue;
            }

            let base = config.base_env().merge(&produced);
            let script_path = resolve_script_path(&self.settings.scripts_dir, &step.script);

            for iteration in &iterations {
                let env = clear_prefixes(
                    &base.clone().merge(&iteration.env()),
                    prefixes.iter().map(String::as_str),
                );
                let task = DeploymentTask {
                    network,
                    script: step.script.clone(),
                    script_path: script_path.clone(),
                    rpc_url: config.rpc_url.clone(),
                    private_key: config.credentials.private_key.clone(),
                    env,
                    index: iteration.index,
                    chain_id: Some(chain_id),
                };

                let outcome = self.executor.run(&task, state).await;
                self.flush(request.destination, state).await?;
                produced.extend(outcome?);
            }
        }

        tracing::info!(%network, "All steps deployed");
        Ok(())
    }

    async fn flush(&self, destination: Destination, state: &Mutex<DeployedState>) -> Result<()> {
        let state = state.lock().await;
        self.store.save(destination, &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_destinations_reject_multiple_networks() {
        for destination in [Destination::Dev, Destination::Prod] {
            let request = DeployRequest::script(
                "Dahlia",
                None,
                destination,
                vec![Network::Ethereum, Network::Sepolia],
            );
            assert!(matches!(request.validate(), Err(DeployError::Validation(_))));
        }
    }

    #[test]
    fn test_sandbox_accepts_multiple_networks() {
        let request = DeployRequest::script("Dahlia", None, Destination::Sandbox, Network::all());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_network_selection_is_rejected() {
        let request = DeployRequest::script("Dahlia", None, Destination::Sandbox, vec![]);
        assert!(matches!(request.validate(), Err(DeployError::Validation(_))));
    }

    #[test]
    fn test_plan_drops_sandbox_only_steps_remotely() {
        let steps = vec![
            PlanStep::new("PointsFactory").sandbox_only(),
            PlanStep::new("Dahlia"),
        ];

        let sandbox = DeployRequest::plan(&steps, Destination::Sandbox, vec![Network::Ethereum]);
        assert_eq!(sandbox.steps.len(), 2);

        let dev = DeployRequest::plan(&steps, Destination::Dev, vec![Network::Ethereum]);
        assert_eq!(dev.steps, vec![PlanStep::new("Dahlia")]);
    }
}
