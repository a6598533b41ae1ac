//! JSON-RPC transport to the ledger node.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RegistryError;

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// A transaction receipt, reduced to what confirmation needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        // Pre-Byzantium receipts carry no status; treat them as mined.
        self.status.as_deref().map(|s| s == "0x1").unwrap_or(true)
    }
}

/// A log entry returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Thin JSON-RPC client over HTTP.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Client for a node on the loopback interface, bypassing any proxy.
    #[cfg(test)]
    pub(crate) fn local(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder().no_proxy().build().unwrap(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!("rpc #{} -> {}", id, method);
        let response: Response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(classify_rpc_error(err.code, err.message));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| RegistryError::Decode(format!("{method}: {e}")))
    }

    pub async fn chain_id(&self) -> Result<u64, RegistryError> {
        let hex: String = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&hex)
    }

    pub async fn block_number(&self) -> Result<u64, RegistryError> {
        let hex: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&hex)
    }

    pub async fn accounts(&self) -> Result<Vec<String>, RegistryError> {
        self.request("eth_accounts", json!([])).await
    }

    /// Read-only call against `to` at the latest block.
    pub async fn call(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, RegistryError> {
        let hex: String = self
            .request(
                "eth_call",
                json!([{ "to": to, "data": super::abi::encode_hex(data) }, "latest"]),
            )
            .await?;
        super::abi::decode_hex(&hex)
    }

    /// Submits a transaction signed by a node-managed account.
    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<String, RegistryError> {
        self.request(
            "eth_sendTransaction",
            json!([{ "from": from, "to": to, "data": super::abi::encode_hex(data) }]),
        )
        .await
    }

    pub async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, RegistryError> {
        self.request("eth_getTransactionReceipt", json!([tx_hash])).await
    }

    pub async fn logs(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
        topics: &[&str],
    ) -> Result<Vec<Log>, RegistryError> {
        self.request(
            "eth_getLogs",
            json!([{
                "address": address,
                "fromBlock": format!("0x{from_block:x}"),
                "toBlock": format!("0x{to_block:x}"),
                "topics": [topics],
            }]),
        )
        .await
    }
}

fn classify_rpc_error(code: i64, message: String) -> RegistryError {
    if message.to_ascii_lowercase().contains("revert") {
        RegistryError::Reverted(message)
    } else {
        RegistryError::Rpc { code, message }
    }
}

/// Parses a JSON-RPC hex quantity such as `0x1a`.
pub fn parse_quantity(s: &str) -> Result<u64, RegistryError> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RegistryError::Decode(format!("quantity without 0x prefix: {s}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| RegistryError::Decode(format!("{s}: {e}")))
}
