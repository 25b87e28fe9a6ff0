//! Recovers application payloads embedded in OP_RETURN outputs.
//!
//! Payloads are base64 text pushed as raw bytes, so the asm form carries
//! `OP_RETURN <hex(base64(payload))>`. Outputs that do not decode that way
//! were not written by us and are skipped.

use crate::client::{BitcoindClient, VerboseTransaction};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chainscan_common::{SourceError, TransactionHandler, TransactionRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NULL_DATA: &str = "nulldata";

/// Verbose transaction lookup by id
#[async_trait]
pub trait TransactionLookup: Send + Sync {
    async fn raw_transaction(&self, txid: &str) -> Result<VerboseTransaction, SourceError>;
}

#[async_trait]
impl TransactionLookup for BitcoindClient {
    async fn raw_transaction(&self, txid: &str) -> Result<VerboseTransaction, SourceError> {
        self.get_raw_transaction_verbose(txid).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReturnPayload {
    pub tx_id: String,
    pub output_index: u32,
    pub data: String,
}

/// Decodes the data push of an OP_RETURN asm string.
pub fn decode_op_return(asm: &str) -> Option<String> {
    let mut parts = asm.split_whitespace();
    if parts.next()? != "OP_RETURN" {
        return None;
    }
    let pushed = hex::decode(parts.next()?).ok()?;
    let decoded = STANDARD.decode(pushed).ok()?;
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

/// Payloads carried by one transaction, in output order.
pub fn payloads_of(tx: &VerboseTransaction) -> Vec<OpReturnPayload> {
    tx.vout
        .iter()
        .filter(|out| out.script_pub_key.kind == NULL_DATA)
        .filter_map(|out| match decode_op_return(&out.script_pub_key.asm) {
            Some(data) => Some(OpReturnPayload {
                tx_id: tx.txid.clone(),
                output_index: out.n,
                data,
            }),
            None => {
                debug!("Skipping foreign OP_RETURN output {}:{}", tx.txid, out.n);
                None
            }
        })
        .collect()
}

/// `TransactionHandler` that logs every recovered OP_RETURN payload.
pub struct OpReturnHandler {
    lookup: Arc<dyn TransactionLookup>,
    retries: u32,
    retry_delay: Duration,
}

impl OpReturnHandler {
    pub fn new(lookup: Arc<dyn TransactionLookup>) -> Self {
        Self {
            lookup,
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn fetch(&self, txid: &str) -> Option<VerboseTransaction> {
        let mut attempt = 0;
        loop {
            match self.lookup.raw_transaction(txid).await {
                Ok(tx) => return Some(tx),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    debug!("Lookup of {} failed (attempt {}): {}", txid, attempt, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    warn!("Skipping transaction {} after {} retries: {}", txid, self.retries, e);
                    return None;
                }
            }
        }
    }

    pub async fn extract(&self, transactions: &[TransactionRecord]) -> Vec<OpReturnPayload> {
        let mut payloads = Vec::new();
        for record in transactions {
            if let Some(tx) = self.fetch(&record.tx_id).await {
                payloads.extend(payloads_of(&tx));
            }
        }
        payloads
    }
}

#[async_trait]
impl TransactionHandler for OpReturnHandler {
    async fn handle(&self, transactions: Vec<TransactionRecord>) {
        debug!("Inspecting {} transactions for OP_RETURN data", transactions.len());
        for payload in self.extract(&transactions).await {
            info!(
                "OP_RETURN payload in {}:{}: {}",
                payload.tx_id, payload.output_index, payload.data
            );
        }
    }
}
