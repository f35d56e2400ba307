//! Sandbox faucet: send ETH from the first pre-funded Anvil account.

use anyhow::{Context, Result};
use url::Url;

use crate::rpc::{self, RpcProbe, await_ready};

/// Anvil account #0, pre-funded with 10000 ETH on every sandbox chain.
pub const ANVIL_FUNDED_ACCOUNT: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

/// Result of a funding transfer.
#[derive(Debug)]
pub struct FundResult {
    pub tx_hash: String,
    /// Recipient balance after the transfer, as a hex quantity.
    pub balance: String,
}

/// Send `amount_eth` from [`ANVIL_FUNDED_ACCOUNT`] to `to_address` on a sandbox chain.
///
/// Waits for the RPC first, then impersonates the funded account so the node
/// signs the transfer itself.
pub async fn fund(
    probe: &RpcProbe,
    rpc_url: &Url,
    to_address: &str,
    amount_eth: f64,
) -> Result<FundResult> {
    validate_address(to_address)?;
    if !amount_eth.is_finite() || amount_eth <= 0.0 {
        anyhow::bail!("Amount must be a positive number of ETH, got {}", amount_eth);
    }
    let amount_wei = eth_to_wei(amount_eth)?;

    await_ready(probe, rpc_url).await;
    let client = probe.client();

    let _: serde_json::Value = rpc::json_rpc_call(
        client,
        rpc_url,
        "anvil_impersonateAccount",
        vec![serde_json::json!(ANVIL_FUNDED_ACCOUNT)],
    )
    .await
    .context("Failed to impersonate the funded account - is this an Anvil node?")?;

    let tx_hash: String = rpc::json_rpc_call(
        client,
        rpc_url,
        "eth_sendTransaction",
        vec![serde_json::json!({
            "from": ANVIL_FUNDED_ACCOUNT,
            "to": to_address,
            "value": format!("0x{:x}", amount_wei),
        })],
    )
    .await
    .context("Failed to send funding transaction")?;

    tracing::info!(%tx_hash, to = %to_address, amount_eth, "Funding transaction sent");

    let balance: String = rpc::json_rpc_call(
        client,
        rpc_url,
        "eth_getBalance",
        vec![serde_json::json!(to_address), serde_json::json!("latest")],
    )
    .await
    .context("Failed to read recipient balance")?;

    Ok(FundResult { tx_hash, balance })
}

/// Validate an Ethereum address format (0x-prefixed, 40 hex chars).
pub fn validate_address(addr: &str) -> Result<()> {
    if !addr.starts_with("0x") || addr.len() != 42 {
        anyhow::bail!(
            "Invalid address format: expected 0x-prefixed 40 hex chars, got '{}'",
            addr
        );
    }

    if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("Invalid address: contains non-hex characters: '{}'", addr);
    }

    Ok(())
}

/// Convert ETH amount (f64) to wei, rounded to gwei precision.
///
/// Fails for negative, non-finite, or amounts that do not fit a `u128` of wei.
pub fn eth_to_wei(eth: f64) -> Result<u128> {
    let gwei = (eth * 1e9).round();
    if !gwei.is_finite() || gwei < 0.0 || gwei >= u128::MAX as f64 {
        anyhow::bail!("Amount out of range: {eth} ETH");
    }
    (gwei as u128)
        .checked_mul(1_000_000_000)
        .with_context(|| format!("Amount out of range: {eth} ETH"))
}

/// Format a wei hex quantity as ETH with 4 decimals.
pub fn format_balance(hex_wei: &str) -> Result<String> {
    let wei = u128::from_str_radix(hex_wei.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid balance quantity: {hex_wei}"))?;
    let milli = wei / 100_000_000_000_000;
    Ok(format!("{}.{:04} ETH", milli / 10_000, milli % 10_000))
}
