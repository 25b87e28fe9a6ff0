use anyhow::{bail, Context, Result};
use num_bigint::BigUint;
use num_traits::ToPrimitive;

/// Parses a chain number that may be decimal or `0x`-prefixed hex.
pub fn parse_number(raw: &str) -> Result<BigUint> {
    let raw = raw.trim();
    let (digits, radix) = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (raw, 10),
    };
    if digits.is_empty() {
        bail!("empty number string {:?}", raw);
    }
    BigUint::parse_bytes(digits.as_bytes(), radix)
        .with_context(|| format!("invalid base-{} number {:?}", radix, raw))
}

/// Parses a seconds-since-epoch timestamp, hex or decimal.
pub fn parse_timestamp(raw: &str) -> Result<i64> {
    let value = parse_number(raw)?;
    value
        .to_i64()
        .with_context(|| format!("timestamp {} out of range", value))
}
