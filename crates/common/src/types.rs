use crate::error::ScanError;
use crate::utils::converter::{parse_number, parse_timestamp};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

// --- Source-side types ---

/// A block as reported by a `BlockSource`, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: String,
    pub parent_hash: String,
    /// Decimal or `0x`-prefixed hex.
    pub height: String,
    /// Seconds since epoch, decimal or `0x`-prefixed hex.
    pub timestamp: String,
    pub transactions: Vec<SourceTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SourceTransaction {
    pub tx_id: String,
    /// Witness hash where the chain distinguishes it, otherwise equal to `tx_id`.
    pub tx_hash: String,
    pub vin_size: u64,
    pub vout_size: u64,
    pub pack_time: i64,
}

// --- Ledger records ---

/// Persisted block row.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BlockRecord {
    /// Assigned by the store on insert, zero until then.
    pub id: u64,
    pub height: BigUint,
    pub hash: String,
    pub parent_hash: String,
    pub created_at: i64,
    pub is_fork: bool,
}

impl BlockRecord {
    /// Normalizes a source block into an unsaved, non-fork record.
    pub fn from_info(info: &BlockInfo) -> Result<Self, ScanError> {
        if info.height.trim().is_empty() {
            return Err(ScanError::InvalidBlock(format!(
                "block {} has an empty height",
                info.hash
            )));
        }
        if info.hash.is_empty() {
            return Err(ScanError::InvalidBlock(format!(
                "block at height {} has an empty hash",
                info.height
            )));
        }

        let height = parse_number(&info.height)
            .map_err(|e| ScanError::InvalidBlock(format!("block {}: {:#}", info.hash, e)))?;
        let created_at = parse_timestamp(&info.timestamp)
            .map_err(|e| ScanError::InvalidBlock(format!("block {}: {:#}", info.hash, e)))?;

        Ok(Self {
            id: 0,
            height,
            hash: info.hash.clone(),
            parent_hash: info.parent_hash.clone(),
            created_at,
            is_fork: false,
        })
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created_at, 0).unwrap_or_default()
    }

    /// Height the scanner should fetch after this block.
    pub fn next_height(&self) -> BigUint {
        &self.height + 1u32
    }
}

/// Persisted transaction row, always written together with its block.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: u64,
    pub block_hash: String,
    pub tx_id: String,
    pub tx_hash: String,
    pub vin_size: u64,
    pub vout_size: u64,
    pub pack_time: i64,
    pub height: BigUint,
    pub is_fork: bool,
}

impl TransactionRecord {
    pub fn from_source(block: &BlockRecord, tx: &SourceTransaction) -> Self {
        Self {
            id: 0,
            block_hash: block.hash.clone(),
            tx_id: tx.tx_id.clone(),
            tx_hash: tx.tx_hash.clone(),
            vin_size: tx.vin_size,
            vout_size: tx.vout_size,
            pack_time: tx.pack_time,
            height: block.height.clone(),
            is_fork: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(height: &str, timestamp: &str) -> BlockInfo {
        BlockInfo {
            hash: "00aa".to_string(),
            parent_hash: "0099".to_string(),
            height: height.to_string(),
            timestamp: timestamp.to_string(),
            transactions: vec![],
        }
    }

    #[test]
    fn test_from_info_decimal() {
        let record = BlockRecord::from_info(&info("101", "1600000000")).unwrap();
        assert_eq!(record.height, BigUint::from(101u32));
        assert_eq!(record.created_at, 1_600_000_000);
        assert_eq!(record.id, 0);
        assert!(!record.is_fork);
        assert_eq!(record.next_height(), BigUint::from(102u32));
    }

    #[test]
    fn test_from_info_hex() {
        let record = BlockRecord::from_info(&info("0x65", "0x5f5e1000")).unwrap();
        assert_eq!(record.height, BigUint::from(101u32));
        assert_eq!(record.created_at, 0x5f5e1000);
    }

    #[test]
    fn test_from_info_empty_height_is_contract_violation() {
        let err = BlockRecord::from_info(&info("", "1")).unwrap_err();
        assert!(matches!(err, ScanError::InvalidBlock(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_from_info_garbage_height() {
        let err = BlockRecord::from_info(&info("12z", "1")).unwrap_err();
        assert!(matches!(err, ScanError::InvalidBlock(_)));
    }

    #[test]
    fn test_transaction_inherits_block_fields() {
        let block = BlockRecord::from_info(&info("7", "10")).unwrap();
        let tx = SourceTransaction {
            tx_id: "t1".into(),
            tx_hash: "w1".into(),
            vin_size: 2,
            vout_size: 3,
            pack_time: 10,
        };
        let record = TransactionRecord::from_source(&block, &tx);
        assert_eq!(record.block_hash, "00aa");
        assert_eq!(record.height, BigUint::from(7u32));
        assert_eq!(record.tx_hash, "w1");
        assert!(!record.is_fork);
    }
}
