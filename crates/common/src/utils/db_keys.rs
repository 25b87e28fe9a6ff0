use crate::error::StoreError;
use num_bigint::BigUint;

const TX_SEPARATOR: u8 = b'#';

/// Order-preserving encoding of a height: two-byte length followed by the
/// big-endian magnitude. Byte order equals numeric order. Heights whose
/// magnitude does not fit the length prefix are rejected.
pub fn height_key(height: &BigUint) -> Result<Vec<u8>, StoreError> {
    let bytes = height.to_bytes_be();
    let len = u16::try_from(bytes.len())
        .map_err(|_| StoreError::Serialization(format!("height of {} bytes has no key encoding", bytes.len())))?;
    let mut key = Vec::with_capacity(2 + bytes.len());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(&bytes);
    Ok(key)
}

pub fn block_hash_to_db_key(hash: &str) -> Vec<u8> {
    hash.as_bytes().to_vec()
}

/// Height index entry: `height_key ‖ hash`.
pub fn height_index_key(height: &BigUint, hash: &str) -> Result<Vec<u8>, StoreError> {
    let mut key = height_key(height)?;
    key.extend_from_slice(hash.as_bytes());
    Ok(key)
}

/// Hash part of a height index entry.
pub fn hash_from_height_index(key: &[u8]) -> Option<String> {
    let len = u16::from_be_bytes(key.get(..2)?.try_into().ok()?) as usize;
    let hash = key.get(2 + len..)?;
    String::from_utf8(hash.to_vec()).ok()
}

fn sortable_timestamp(created_at: i64) -> [u8; 8] {
    ((created_at as u64) ^ (1 << 63)).to_be_bytes()
}

/// Creation-time index entry: `timestamp ‖ height_key ‖ hash`, so blocks
/// sharing a timestamp fall back to height order.
pub fn created_index_key(created_at: i64, height: &BigUint, hash: &str) -> Result<Vec<u8>, StoreError> {
    let mut key = Vec::with_capacity(8 + 34 + hash.len());
    key.extend_from_slice(&sortable_timestamp(created_at));
    key.extend_from_slice(&height_index_key(height, hash)?);
    Ok(key)
}

/// Hash part of a creation-time index entry.
pub fn hash_from_created_index(key: &[u8]) -> Option<String> {
    hash_from_height_index(key.get(8..)?)
}

pub fn tx_prefix(block_hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(block_hash.len() + 1);
    key.extend_from_slice(block_hash.as_bytes());
    key.push(TX_SEPARATOR);
    key
}

/// Transaction entry: `block_hash ‖ '#' ‖ tx_id`.
pub fn tx_key(block_hash: &str, tx_id: &str) -> Vec<u8> {
    let mut key = tx_prefix(block_hash);
    key.extend_from_slice(tx_id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_key_orders_numerically() {
        let heights: Vec<BigUint> = [0u64, 1, 9, 10, 255, 256, 65_535, 1 << 40]
            .iter()
            .map(|h| BigUint::from(*h))
            .collect();
        for pair in heights.windows(2) {
            assert!(
                height_key(&pair[0]).unwrap() < height_key(&pair[1]).unwrap(),
                "{} vs {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_height_index_roundtrips_hash() {
        let key = height_index_key(&BigUint::from(700_000u32), "00ff").unwrap();
        assert_eq!(hash_from_height_index(&key).as_deref(), Some("00ff"));
    }

    #[test]
    fn test_created_index_orders_by_time_then_height() {
        let early = created_index_key(-10, &BigUint::from(9u32), "aa").unwrap();
        let later = created_index_key(5, &BigUint::from(1u32), "bb").unwrap();
        let same_time_higher = created_index_key(5, &BigUint::from(2u32), "aa").unwrap();
        assert!(early < later);
        assert!(later < same_time_higher);
        assert_eq!(hash_from_created_index(&same_time_higher).as_deref(), Some("aa"));
    }

    #[test]
    fn test_oversized_height_has_no_key() {
        let widest = BigUint::from_bytes_be(&vec![0xff; u16::MAX as usize]);
        assert_eq!(height_key(&widest).unwrap().len(), 2 + u16::MAX as usize);

        let oversized = BigUint::from_bytes_be(&vec![0x01; u16::MAX as usize + 1]);
        assert!(matches!(height_key(&oversized), Err(StoreError::Serialization(_))));
        assert!(height_index_key(&oversized, "aa").is_err());
        assert!(created_index_key(0, &oversized, "aa").is_err());
    }

    #[test]
    fn test_tx_keys_share_block_prefix() {
        let key = tx_key("blk", "t1");
        assert!(key.starts_with(&tx_prefix("blk")));
        assert!(!key.starts_with(&tx_prefix("bl")));
    }
}
