//! JSON-RPC interface to the local Bitcoin node.
//!
//! The pool core only ever needs two calls: `getblocktemplate` to learn
//! what to mine, and `submitblock` to hand back a solved block. Both are
//! expressed through the `NodeClient` trait so tests and the Stratum v2
//! frontend experiments can inject their own node.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("node rejected block: {0}")]
    BlockRejected(String),

    #[error("malformed node response: {0}")]
    InvalidResponse(String),
}

impl NodeError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Transport(_) => true,
            NodeError::Rpc { code, .. } => *code == -28, // warming up
            NodeError::BlockRejected(_) | NodeError::InvalidResponse(_) => false,
        }
    }
}

/// One non-coinbase transaction from `getblocktemplate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GbtTransaction {
    /// Raw transaction hex.
    pub data: String,
    pub txid: String,
    /// wtxid; equal to `txid` for legacy transactions.
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: Option<u64>,
}

/// The subset of `getblocktemplate` the pool consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplateResult {
    pub version: i32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(default)]
    pub transactions: Vec<GbtTransaction>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(rename = "mintime")]
    pub min_time: u64,
    #[serde(rename = "curtime")]
    pub cur_time: u64,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub mutable: Vec<String>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    #[serde(default, rename = "longpollid")]
    pub longpoll_id: Option<String>,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch a block template. With a longpoll id the node holds the
    /// request until the template changes.
    async fn get_block_template(
        &self,
        longpoll_id: Option<&str>,
    ) -> Result<GetBlockTemplateResult, NodeError>;

    /// Submit a serialised block. `Ok(())` means the node accepted it;
    /// a rejection reason surfaces as `NodeError::BlockRejected`.
    async fn submit_block(&self, block_hex: &str) -> Result<(), NodeError>;

    /// Endpoint description for logs and pending-submission records.
    fn endpoint(&self) -> String;
}

/// `NodeClient` over bitcoind's HTTP JSON-RPC with basic auth.
pub struct BitcoindClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl BitcoindClient {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            // Longpoll requests stay open until the chain tip moves, so
            // no global request timeout here; connect timeout only.
            http: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "tanuki-pool",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let envelope: Value = response.json().await?;
        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(NodeError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| NodeError::InvalidResponse("missing result field".into()))
    }
}

#[async_trait]
impl NodeClient for BitcoindClient {
    async fn get_block_template(
        &self,
        longpoll_id: Option<&str>,
    ) -> Result<GetBlockTemplateResult, NodeError> {
        let mut request = json!({"rules": ["segwit"]});
        if let Some(id) = longpoll_id {
            request["longpollid"] = json!(id);
        }

        let result = self.call("getblocktemplate", json!([request])).await?;
        serde_json::from_value(result)
            .map_err(|e| NodeError::InvalidResponse(format!("getblocktemplate: {e}")))
    }

    async fn submit_block(&self, block_hex: &str) -> Result<(), NodeError> {
        match self.call("submitblock", json!([block_hex])).await? {
            Value::Null => Ok(()),
            Value::String(reason) => Err(NodeError::BlockRejected(reason)),
            other => Err(NodeError::InvalidResponse(format!(
                "submitblock returned {other}"
            ))),
        }
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
