//! End-to-end tests of the deployment pipeline with a scripted tool and a fixed RPC.

use std::{collections::HashMap, sync::Mutex};

use forgecast_deploy::{
    DeployError, DeployRequest, DeploymentTask, Destination, Executor, LivenessProbe, LogSink,
    Network, Pipeline, PlanStep, ScriptOutput, ScriptRunner, Settings, StateStore, StaticConfig,
    config::ProcessEnv, iteration::INDEX, pipeline::CHAIN_ID,
};
use tempdir::TempDir;
use url::Url;

const CHAIN: u64 = 31337;

const NETWORKS_TOML: &str = r#"
    [ethereum]
    GRAPH_NODE_RPC_PORT = "8020"
    ETHEREUM__FEE = "5"
    PointsFactory = false

    [[ethereum.WrappedVault]]
    NAME = "stone-weth"
    STONE_WETH__ORACLE = "0x01"

    [[ethereum.WrappedVault]]
    NAME = "wbera-usdc"

    [cartio]
    FEE = "7"
"#;

/// Records every task and answers with canned outputs keyed by network and task label.
#[derive(Default)]
struct ScriptedRunner {
    spawned: Mutex<Vec<DeploymentTask>>,
    outputs: HashMap<(Network, String), ScriptOutput>,
}

impl ScriptedRunner {
    fn reply(mut self, network: Network, label: &str, success: bool, stdout: &str) -> Self {
        self.outputs.insert(
            (network, label.to_string()),
            ScriptOutput {
                success,
                code: Some(if success { 0 } else { 1 }),
                stdout: stdout.to_string(),
            },
        );
        self
    }

    fn spawned(&self) -> Vec<DeploymentTask> {
        self.spawned.lock().unwrap().clone()
    }

    fn spawned_on(&self, network: Network) -> Vec<String> {
        self.spawned()
            .into_iter()
            .filter(|task| task.network == network)
            .map(|task| task.label())
            .collect()
    }
}

impl ScriptRunner for ScriptedRunner {
    async fn run(&self, task: &DeploymentTask, _sink: &LogSink) -> anyhow::Result<ScriptOutput> {
        self.spawned.lock().unwrap().push(task.clone());
        Ok(self
            .outputs
            .get(&(task.network, task.label()))
            .cloned()
            .unwrap_or(ScriptOutput {
                success: true,
                code: Some(0),
                stdout: String::new(),
            }))
    }
}

struct LiveProbe;

impl LivenessProbe for LiveProbe {
    async fn chain_id(&self, _endpoint: &Url) -> anyhow::Result<u64> {
        Ok(CHAIN)
    }
}

fn settings(dir: &TempDir) -> Settings {
    Settings {
        state_dir: dir.path().join("deployments"),
        ..Settings::default()
    }
}

fn pipeline(dir: &TempDir, runner: ScriptedRunner) -> Pipeline<ScriptedRunner, LiveProbe> {
    Pipeline::new(
        Executor::new(runner, LogSink::in_memory()),
        LiveProbe,
        settings(dir),
    )
    .with_static_config(StaticConfig::from_toml(NETWORKS_TOML).unwrap())
}

fn runner_of(pipeline: &Pipeline<ScriptedRunner, LiveProbe>) -> &ScriptedRunner {
    pipeline.executor().runner()
}

#[tokio::test]
async fn test_remote_fan_out_is_rejected_without_spawning() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let pipeline = pipeline(&dir, ScriptedRunner::default());

    let request = DeployRequest::script(
        "Dahlia",
        None,
        Destination::Prod,
        vec![Network::Ethereum, Network::Sepolia],
    );
    let err = pipeline.deploy(&request).await.unwrap_err();

    assert!(matches!(err, DeployError::Validation(_)));
    assert!(runner_of(&pipeline).spawned().is_empty());
    assert!(!pipeline.store().path(Destination::Prod).exists());
}

#[tokio::test]
async fn test_unresolvable_prod_config_fails_before_spawning() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let pipeline = pipeline(&dir, ScriptedRunner::default());

    let request = DeployRequest::script("Dahlia", None, Destination::Prod, vec![Network::Sepolia]);
    let err = pipeline.deploy(&request).await.unwrap_err();

    assert!(matches!(err, DeployError::Configuration(_)));
    assert!(runner_of(&pipeline).spawned().is_empty());
    // Nothing was written: no state directory, no lock file.
    assert!(!dir.path().join("deployments").exists());
}

#[tokio::test]
async fn test_sandbox_fan_out_records_artifacts_per_network() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let runner = ScriptedRunner::default()
        .reply(Network::Ethereum, "Dahlia", true, "Dahlia=0xAAA\nnothing here")
        .reply(Network::Cartio, "Dahlia", true, "Dahlia=0xBBB\nCount=42");
    let pipeline = pipeline(&dir, runner);

    let request = DeployRequest::script(
        "Dahlia",
        None,
        Destination::Sandbox,
        vec![Network::Ethereum, Network::Cartio],
    );
    let state = pipeline.deploy(&request).await.unwrap();

    let ethereum = state.network(Network::Ethereum);
    assert_eq!(ethereum.get("Dahlia").map(String::as_str), Some("0xAAA"));
    assert_eq!(ethereum.get(CHAIN_ID).map(String::as_str), Some("31337"));
    assert_eq!(ethereum.get("GRAPH_NODE_RPC_PORT").map(String::as_str), Some("8020"));

    let cartio = state.network(Network::Cartio);
    assert_eq!(cartio.get("Dahlia").map(String::as_str), Some("0xBBB"));
    assert_eq!(cartio.get("Count").map(String::as_str), Some("42"));
    assert!(!cartio.contains_key("GRAPH_NODE_RPC_PORT"));

    let persisted = StateStore::new(dir.path().join("deployments"))
        .load(Destination::Sandbox)
        .unwrap();
    assert_eq!(persisted, state);
}

#[tokio::test]
async fn test_tasks_get_network_env_and_tool_arguments() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let pipeline = pipeline(&dir, ScriptedRunner::default());

    let request = DeployRequest::script("Dahlia", None, Destination::Sandbox, vec![Network::Cartio]);
    pipeline.deploy(&request).await.unwrap();

    let spawned = runner_of(&pipeline).spawned();
    assert_eq!(spawned.len(), 1);
    let task = &spawned[0];
    assert_eq!(task.chain_id, Some(CHAIN));
    assert_eq!(
        task.args()[..4].to_vec(),
        vec!["script", "script/Dahlia.s.sol", "--rpc-url", "http://localhost:8548"]
    );
    assert_eq!(task.env.get("FEE").map(String::as_str), Some("7"));
    assert_eq!(task.env.get("RPC_URL").map(String::as_str), Some("http://localhost:8548"));
    assert_eq!(task.env.get(CHAIN_ID).map(String::as_str), Some("31337"));
    assert!(task.env.contains_key("PRIVATE_KEY"));
}

#[tokio::test]
async fn test_iterator_runs_once_per_element_with_cleared_prefixes() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let pipeline = pipeline(&dir, ScriptedRunner::default());

    let request = DeployRequest::script("WrappedVault", None, Destination::Sandbox, vec![Network::Ethereum])
        .with_clear_prefixes(vec!["STONE_WETH".to_string()]);
    pipeline.deploy(&request).await.unwrap();

    let spawned = runner_of(&pipeline).spawned();
    let labels: Vec<_> = spawned.iter().map(DeploymentTask::label).collect();
    assert_eq!(labels, vec!["WrappedVault[0]", "WrappedVault[1]"]);

    let first = &spawned[0].env;
    assert_eq!(first.get(INDEX).map(String::as_str), Some("0"));
    assert_eq!(first.get("NAME").map(String::as_str), Some("stone-weth"));
    assert_eq!(first.get("ORACLE").map(String::as_str), Some("0x01"));
    assert_eq!(first.get("FEE").map(String::as_str), Some("5"));
    assert!(!first.contains_key("ETHEREUM__FEE"));

    let second = &spawned[1].env;
    assert_eq!(second.get(INDEX).map(String::as_str), Some("1"));
    assert_eq!(second.get("NAME").map(String::as_str), Some("wbera-usdc"));
    assert!(!second.contains_key("ORACLE"));
}

#[tokio::test]
async fn test_failure_aborts_only_the_failing_network() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let runner = ScriptedRunner::default()
        .reply(Network::Ethereum, "IrmFactory", false, "IrmFactory=0x01\nError: revert")
        .reply(Network::Cartio, "IrmFactory", true, "IrmFactory=0x02");
    let pipeline = pipeline(&dir, runner);

    let steps = vec![PlanStep::new("IrmFactory"), PlanStep::new("Dahlia")];
    let request = DeployRequest::plan(
        &steps,
        Destination::Sandbox,
        vec![Network::Ethereum, Network::Cartio],
    );
    let err = pipeline.deploy(&request).await.unwrap_err();

    let DeployError::Networks(failures) = err else {
        panic!("expected per-network failures");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Network::Ethereum);
    assert!(matches!(
        failures[0].1,
        DeployError::Subprocess {
            network: Network::Ethereum,
            code: Some(1),
            ..
        }
    ));

    let runner = runner_of(&pipeline);
    assert_eq!(runner.spawned_on(Network::Ethereum), vec!["IrmFactory"]);
    assert_eq!(runner.spawned_on(Network::Cartio), vec!["IrmFactory", "Dahlia"]);

    let persisted = pipeline.store().load(Destination::Sandbox).unwrap();
    assert_eq!(
        persisted.network(Network::Ethereum).get("IrmFactory").map(String::as_str),
        Some("0x01")
    );
    assert_eq!(
        persisted.network(Network::Cartio).get("IrmFactory").map(String::as_str),
        Some("0x02")
    );
}

#[tokio::test]
async fn test_skipped_field_disables_the_step() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let pipeline = pipeline(&dir, ScriptedRunner::default());

    let request = DeployRequest::script(
        "PointsFactory",
        None,
        Destination::Sandbox,
        vec![Network::Ethereum, Network::Cartio],
    );
    pipeline.deploy(&request).await.unwrap();

    let runner = runner_of(&pipeline);
    assert!(runner.spawned_on(Network::Ethereum).is_empty());
    assert_eq!(runner.spawned_on(Network::Cartio), vec!["PointsFactory"]);
}

#[tokio::test]
async fn test_later_steps_see_artifacts_from_earlier_steps() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let runner = ScriptedRunner::default().reply(Network::Cartio, "Dahlia", true, "Dahlia=0x0a7e");
    let pipeline = pipeline(&dir, runner);

    let steps = vec![PlanStep::new("Dahlia"), PlanStep::new("Timelock")];
    let request = DeployRequest::plan(&steps, Destination::Sandbox, vec![Network::Cartio]);
    pipeline.deploy(&request).await.unwrap();

    let spawned = runner_of(&pipeline).spawned();
    assert!(!spawned[0].env.contains_key("Dahlia"));
    assert_eq!(spawned[1].env.get("Dahlia").map(String::as_str), Some("0x0a7e"));
}

#[tokio::test]
async fn test_prior_state_seeds_the_environment_unless_forced() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let store = StateStore::new(dir.path().join("deployments"));
    let mut prior = forgecast_deploy::DeployedState::default();
    prior.record(Network::Cartio, "Dahlia", "0xdead");
    store.save(Destination::Sandbox, &prior).unwrap();

    let pipeline = pipeline(&dir, ScriptedRunner::default());
    let request = DeployRequest::script("WrappedVaultFactory", None, Destination::Sandbox, vec![Network::Cartio]);

    pipeline.deploy(&request).await.unwrap();
    pipeline.deploy(&request.clone().with_force(true)).await.unwrap();

    let spawned = runner_of(&pipeline).spawned();
    assert_eq!(spawned[0].env.get("Dahlia").map(String::as_str), Some("0xdead"));
    assert!(!spawned[1].env.contains_key("Dahlia"));

    // Forcing does not erase what is already recorded.
    let persisted = store.load(Destination::Sandbox).unwrap();
    assert_eq!(
        persisted.network(Network::Cartio).get("Dahlia").map(String::as_str),
        Some("0xdead")
    );
}

#[tokio::test]
async fn test_recorded_artifact_does_not_collapse_an_iterator_field() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let store = StateStore::new(dir.path().join("deployments"));
    let mut prior = forgecast_deploy::DeployedState::default();
    prior.record(Network::Ethereum, "WrappedVault", "0x01");
    prior.record(Network::Ethereum, "PointsFactory", "0x02");
    store.save(Destination::Sandbox, &prior).unwrap();

    let pipeline = pipeline(&dir, ScriptedRunner::default());
    let steps = vec![PlanStep::new("PointsFactory"), PlanStep::new("WrappedVault")];
    let request = DeployRequest::plan(&steps, Destination::Sandbox, vec![Network::Ethereum]);
    pipeline.deploy(&request).await.unwrap();

    let spawned = runner_of(&pipeline).spawned();
    let labels: Vec<_> = spawned.iter().map(DeploymentTask::label).collect();
    assert_eq!(labels, vec!["WrappedVault[0]", "WrappedVault[1]"]);
    assert_eq!(spawned[1].env.get(INDEX).map(String::as_str), Some("1"));
}

#[tokio::test]
async fn test_overlapping_runs_on_a_destination_are_rejected() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let pipeline = pipeline(&dir, ScriptedRunner::default());
    let _held = pipeline.store().lock(Destination::Sandbox).unwrap();

    let request = DeployRequest::script("Dahlia", None, Destination::Sandbox, vec![Network::Cartio]);
    let err = pipeline.deploy(&request).await.unwrap_err();

    assert!(matches!(err, DeployError::Validation(_)));
    assert!(runner_of(&pipeline).spawned().is_empty());
}

#[tokio::test]
async fn test_dev_destination_uses_explicit_process_credentials() {
    let dir = TempDir::new("forgecast-pipeline").unwrap();
    let source = StaticConfig::from_toml(
        r#"
        [sepolia]
        RPC_URL = "https://sepolia.example.org"
        SCANNER_BASE_URL = "https://sepolia-scan.example.org"
        "#,
    )
    .unwrap();
    let env: ProcessEnv = [(
        "PRIVATE_KEY".to_string(),
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
    )]
    .into_iter()
    .collect();

    let pipeline = Pipeline::new(
        Executor::new(ScriptedRunner::default(), LogSink::in_memory()),
        LiveProbe,
        settings(&dir),
    )
    .with_static_config(source)
    .with_process_env(env);

    let request = DeployRequest::script("Dahlia", None, Destination::Dev, vec![Network::Sepolia]);
    pipeline.deploy(&request).await.unwrap();

    let spawned = runner_of(&pipeline).spawned();
    assert_eq!(spawned[0].rpc_url.as_str(), "https://sepolia.example.org/");
    assert_eq!(
        spawned[0].private_key,
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
    );
    assert_eq!(spawned[0].env.get("DESTINATION").map(String::as_str), Some("dev"));
}
