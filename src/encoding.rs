use anyhow::{bail, Context, Result};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::ParseUnits;

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

pub fn parse_bytes_hex(s: &str) -> Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).context("invalid hex bytes")?;
    Ok(Bytes::from(bytes))
}

/// Scale a human decimal amount ("1.5") into token base units.
///
/// Rejects negative amounts and amounts with more fractional digits than the
/// token carries, rather than silently truncating.
pub fn scale_amount(amount: &str, decimals: u8) -> Result<U256> {
    let parsed = ethers::utils::parse_units(amount, u32::from(decimals))
        .with_context(|| format!("invalid amount {amount:?} for a {decimals}-decimals token"))?;
    match parsed {
        ParseUnits::U256(v) => Ok(v),
        ParseUnits::I256(_) => bail!("amount must be positive, got {amount:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_zero_is_short_form() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(255u64)), "0xff");
    }

    #[test]
    fn quantity_round_trip() {
        let v = U256::from(1_234_567_890u64);
        assert_eq!(parse_u256_quantity(&fmt_u256(v)).unwrap(), v);
        // bare and empty forms are accepted too
        assert_eq!(parse_u256_quantity("ff").unwrap(), U256::from(255u64));
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
    }

    #[test]
    fn h256_requires_exactly_32_bytes() {
        let ok = format!("0x{}", "11".repeat(32));
        assert!(parse_h256(&ok).is_ok());
        assert!(parse_h256("0x1234").is_err());
    }

    #[test]
    fn bytes_hex_accepts_prefixed_and_bare() {
        let b = parse_bytes_hex("0xdeadbeef").unwrap();
        assert_eq!(b, Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(parse_bytes_hex("dead").unwrap(), Bytes::from(vec![0xde, 0xad]));
        assert!(parse_bytes_hex("0xzz").is_err());
    }

    #[test]
    fn scale_amount_whole_and_fractional() {
        assert_eq!(scale_amount("1", 6).unwrap(), U256::from(1_000_000u64));
        assert_eq!(scale_amount("1.5", 6).unwrap(), U256::from(1_500_000u64));
        assert_eq!(scale_amount("0.000001", 6).unwrap(), U256::from(1u64));
        assert_eq!(scale_amount("42", 0).unwrap(), U256::from(42u64));
    }

    #[test]
    fn scale_amount_rejects_excess_fractional_digits() {
        assert!(scale_amount("0.0000001", 6).is_err());
    }

    #[test]
    fn scale_amount_rejects_garbage_and_negatives() {
        assert!(scale_amount("abc", 6).is_err());
        assert!(scale_amount("-1", 6).is_err());
    }
}
