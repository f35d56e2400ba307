//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::{future::Future, time::Duration};

use anyhow::Context;
use backon::{ConstantBuilder, Retryable, Sleeper};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed interval between readiness probes.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url.clone())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        anyhow::bail!(
            "RPC error: {}",
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        );
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(raw: &str) -> Result<u64, anyhow::Error> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex quantity: {raw}"))
}

/// A minimal read call answering whether a chain is live.
pub trait LivenessProbe {
    /// Return the chain id served at `endpoint`.
    fn chain_id(&self, endpoint: &Url) -> impl Future<Output = Result<u64, anyhow::Error>> + Send;
}

/// [`LivenessProbe`] backed by `eth_chainId` over HTTP.
#[derive(Debug, Clone)]
pub struct RpcProbe {
    client: reqwest::Client,
}

impl RpcProbe {
    pub fn new() -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: create_client()?,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl LivenessProbe for RpcProbe {
    async fn chain_id(&self, endpoint: &Url) -> Result<u64, anyhow::Error> {
        let raw: String = json_rpc_call(&self.client, endpoint, "eth_chainId", vec![]).await?;
        parse_quantity(&raw)
    }
}

/// Block until `endpoint` answers a liveness probe and return its chain id.
///
/// Failures are logged and retried every [`READINESS_POLL_INTERVAL`], with no
/// attempt limit and no timeout.
pub async fn await_ready<P: LivenessProbe>(probe: &P, endpoint: &Url) -> u64 {
    await_ready_with(probe, endpoint, tokio::time::sleep).await
}

/// [`await_ready`] with a caller supplied sleeper.
pub async fn await_ready_with<P, S>(probe: &P, endpoint: &Url, sleeper: S) -> u64
where
    P: LivenessProbe,
    S: Sleeper,
{
    let backoff = ConstantBuilder::default()
        .with_delay(READINESS_POLL_INTERVAL)
        .without_max_times();

    let outcome = (|| probe.chain_id(endpoint))
        .retry(backoff)
        .sleep(sleeper)
        .notify(|err: &anyhow::Error, _| {
            tracing::warn!(rpc_url = %endpoint, error = %err, "RPC is not ready yet, retrying...");
        })
        .await;

    match outcome {
        Ok(chain_id) => {
            tracing::info!(rpc_url = %endpoint, chain_id, "RPC is ready");
            chain_id
        }
        // The backoff never runs out, so the retry loop only returns on success.
        Err(err) => unreachable!("unbounded readiness retry gave up: {err:#}"),
    }
}
