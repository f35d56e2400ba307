//! forgecast-deploy - Multi-network smart contract deployment pipeline.
//!
//! This crate drives a Foundry-style deployment tool across one or more chains:
//! it resolves per-network configuration, waits for each RPC to come up, runs
//! deployment scripts in order (repeating them over iterator fields), and keeps
//! a durable registry of what was deployed where.

mod error;
pub use error::{DeployError, Result};

mod network;
pub use network::{Destination, Network, SandboxPorts};

mod env;
pub use env::{EnvBag, SCOPE_SEPARATOR, clear_prefix, clear_prefixes};

pub mod config;
pub use config::{ResolvedConfig, StaticConfig};

pub mod iteration;
pub use iteration::{Iteration, expand};

pub mod state;
pub use state::{ArtifactMap, DeployedState, StateStore};

pub mod settings;
pub use settings::{ArtifactSource, PlanStep, Settings};

pub mod rpc;
pub use rpc::{LivenessProbe, RpcProbe, await_ready};

pub mod executor;
pub use executor::{DeploymentTask, Executor, ForgeRunner, LogSink, ScriptOutput, ScriptRunner};

pub mod pipeline;
pub use pipeline::{DeployRequest, Pipeline};

pub mod compose;
pub use compose::{Compose, ComposeAction};

pub mod faucet;
