//! bitcoind JSON-RPC client.

use anyhow::Result;
use async_trait::async_trait;
use chainscan_common::{BlockInfo, BlockSource, MempoolSource, SourceError, SourceTransaction};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// bitcoind returns this while loading the block index
const RPC_IN_WARMUP: i64 = -28;

/// Node connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_url() -> String { "http://127.0.0.1:8332".to_string() }
fn default_timeout_secs() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// `getblock <hash> 2`
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    #[serde(default)]
    pub previousblockhash: Option<String>,
    #[serde(default)]
    pub tx: Vec<VerboseTransaction>,
}

/// `getrawtransaction <txid> true`, also the entries of a verbose block
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTransaction {
    pub txid: String,
    pub hash: String,
    #[serde(default)]
    pub vin: Vec<serde_json::Value>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    /// Only present for confirmed transactions looked up directly
    #[serde(default)]
    pub time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxOutput {
    #[serde(default)]
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// `getblockheader <hash>`
#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub previousblockhash: Option<String>,
}

pub struct BitcoindClient {
    config: NodeConfig,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl BitcoindClient {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, SourceError> {
        let payload = serde_json::json!({
            "jsonrpc": "1.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.config.url).json(&payload);
        if !self.config.user.is_empty() {
            request = request.basic_auth(&self.config.user, Some(&self.config.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("{} request failed: {}", method, e)))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Transient(format!("{} response interrupted: {}", method, e)))?;

        debug!("{} -> HTTP {} ({} bytes)", method, status, body.len());
        decode_response(method, status, &body)
    }

    pub async fn get_block_count(&self) -> Result<u64, SourceError> {
        self.call("getblockcount", serde_json::json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, SourceError> {
        self.call("getblockhash", serde_json::json!([height])).await
    }

    pub async fn get_block_verbose(&self, hash: &str) -> Result<VerboseBlock, SourceError> {
        self.call("getblock", serde_json::json!([hash, 2])).await
    }

    pub async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, SourceError> {
        self.call("getblockheader", serde_json::json!([hash, true])).await
    }

    pub async fn get_raw_mempool(&self) -> Result<Vec<String>, SourceError> {
        self.call("getrawmempool", serde_json::json!([])).await
    }

    pub async fn get_raw_transaction_verbose(&self, txid: &str) -> Result<VerboseTransaction, SourceError> {
        self.call("getrawtransaction", serde_json::json!([txid, true])).await
    }
}

/// Maps an HTTP reply onto a result. bitcoind reports RPC failures with a
/// non-2xx status and a JSON body, so the body is parsed first.
pub(crate) fn decode_response<T: DeserializeOwned>(
    method: &str,
    status: StatusCode,
    body: &[u8],
) -> Result<T, SourceError> {
    let response: RpcResponse<T> = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(e) => {
            let reason = format!("{} returned HTTP {}: {}", method, status, e);
            return Err(if status.is_server_error() {
                SourceError::Transient(reason)
            } else {
                SourceError::Fatal(reason)
            });
        }
    };

    if let Some(error) = response.error {
        let reason = format!("{} failed with code {}: {}", method, error.code, error.message);
        return Err(if error.code == RPC_IN_WARMUP {
            SourceError::Transient(reason)
        } else {
            SourceError::Fatal(reason)
        });
    }

    response
        .result
        .ok_or_else(|| SourceError::Transient(format!("{} returned an empty result", method)))
}

impl VerboseBlock {
    pub fn into_block_info(self) -> BlockInfo {
        let time = self.time;
        let hash = self.hash;
        BlockInfo {
            parent_hash: self.previousblockhash.unwrap_or_default(),
            height: self.height.to_string(),
            timestamp: time.to_string(),
            transactions: self
                .tx
                .into_iter()
                .map(|tx| SourceTransaction {
                    vin_size: tx.vin.len() as u64,
                    vout_size: tx.vout.len() as u64,
                    pack_time: tx.time.unwrap_or(time),
                    tx_id: tx.txid,
                    tx_hash: tx.hash,
                })
                .collect(),
            hash,
        }
    }
}

#[async_trait]
impl BlockSource for BitcoindClient {
    async fn latest_height(&self) -> Result<BigUint, SourceError> {
        self.get_block_count().await.map(BigUint::from)
    }

    async fn block_info(&self, height: &BigUint) -> Result<BlockInfo, SourceError> {
        let height = height
            .to_u64()
            .ok_or_else(|| SourceError::Fatal(format!("height {} is out of range", height)))?;
        let hash = self.get_block_hash(height).await?;
        let block = self.get_block_verbose(&hash).await?;
        Ok(block.into_block_info())
    }

    async fn parent_hash(&self, hash: &str) -> Result<String, SourceError> {
        let header = self.get_block_header(hash).await?;
        header
            .previousblockhash
            .ok_or_else(|| SourceError::Fatal(format!("block {} has no parent", hash)))
    }
}

#[async_trait]
impl MempoolSource for BitcoindClient {
    async fn pending_transactions(&self) -> Result<Vec<String>, SourceError> {
        self.get_raw_mempool().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_JSON: &str = r#"{
        "result": {
            "hash": "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
            "confirmations": 3,
            "height": 600000,
            "time": 1571443461,
            "previousblockhash": "00000000000000000003ecd827f336c6971f6f77a0b9fba362398dd867975645",
            "tx": [
                {
                    "txid": "a1",
                    "hash": "w1",
                    "vin": [{"coinbase": "03c02709"}],
                    "vout": [
                        {"value": 12.5, "n": 0, "scriptPubKey": {"asm": "OP_DUP", "type": "pubkeyhash"}},
                        {"value": 0.0, "n": 1, "scriptPubKey": {"asm": "OP_RETURN aa21a9ed", "type": "nulldata"}}
                    ]
                },
                {
                    "txid": "a2",
                    "hash": "a2",
                    "vin": [{"txid": "ff", "vout": 0}, {"txid": "fe", "vout": 1}],
                    "vout": [{"value": 0.1, "n": 0, "scriptPubKey": {"asm": "OP_HASH160", "type": "scripthash"}}]
                }
            ]
        },
        "error": null,
        "id": 3
    }"#;

    #[test]
    fn test_verbose_block_maps_to_block_info() {
        let block: VerboseBlock = decode_response("getblock", StatusCode::OK, BLOCK_JSON.as_bytes()).unwrap();
        let info = block.into_block_info();

        assert_eq!(info.height, "600000");
        assert_eq!(info.timestamp, "1571443461");
        assert!(info.parent_hash.starts_with("00000000000000000003ecd8"));
        assert_eq!(info.transactions.len(), 2);

        let coinbase = &info.transactions[0];
        assert_eq!(coinbase.tx_id, "a1");
        assert_eq!(coinbase.tx_hash, "w1");
        assert_eq!((coinbase.vin_size, coinbase.vout_size), (1, 2));
        assert_eq!(coinbase.pack_time, 1571443461);
        assert_eq!(info.transactions[1].vin_size, 2);
    }

    #[test]
    fn test_genesis_has_empty_parent() {
        let body = br#"{"result": {"hash": "g", "height": 0, "time": 1231006505, "tx": []}, "error": null, "id": 1}"#;
        let block: VerboseBlock = decode_response("getblock", StatusCode::OK, body).unwrap();
        assert_eq!(block.into_block_info().parent_hash, "");
    }

    #[test]
    fn test_warmup_is_transient() {
        let body = br#"{"result": null, "error": {"code": -28, "message": "Loading block index..."}, "id": 1}"#;
        let err = decode_response::<u64>("getblockcount", StatusCode::INTERNAL_SERVER_ERROR, body).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_rpc_error_is_fatal() {
        let body = br#"{"result": null, "error": {"code": -5, "message": "Block not found"}, "id": 1}"#;
        let err = decode_response::<BlockHeader>("getblockheader", StatusCode::NOT_FOUND, body).unwrap_err();
        assert_eq!(
            err,
            SourceError::Fatal("getblockheader failed with code -5: Block not found".into())
        );
    }

    #[test]
    fn test_null_result_is_transient() {
        let body = br#"{"result": null, "error": null, "id": 1}"#;
        let err = decode_response::<String>("getblockhash", StatusCode::OK, body).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_non_json_body_classified_by_status() {
        let unavailable = decode_response::<u64>("getblockcount", StatusCode::SERVICE_UNAVAILABLE, b"Work queue depth exceeded");
        assert!(unavailable.unwrap_err().is_transient());

        let unauthorized = decode_response::<u64>("getblockcount", StatusCode::UNAUTHORIZED, b"");
        assert!(!unauthorized.unwrap_err().is_transient());
    }

    #[test]
    fn test_mempool_listing() {
        let body = br#"{"result": ["t1", "t2"], "error": null, "id": 9}"#;
        let hashes: Vec<String> = decode_response("getrawmempool", StatusCode::OK, body).unwrap();
        assert_eq!(hashes, vec!["t1", "t2"]);
    }

    #[test]
    fn test_node_config_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"user": "rpc"}"#).unwrap();
        assert_eq!(config.url, "http://127.0.0.1:8332");
        assert_eq!(config.user, "rpc");
        assert_eq!(config.timeout_secs, 30);
        assert!(BitcoindClient::new(config).is_ok());
    }
}
