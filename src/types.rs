use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::Value;

use crate::encoding::{fmt_address, fmt_bytes, fmt_u256};

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// EntryPoint v0.7 packs gas fields differently; this tool targets v0.6 only,
/// which is what the token paymaster service signs over.
#[derive(Clone, Debug)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// JSON shape expected by bundler and paymaster RPC methods: camelCase
    /// keys, quantities as 0x-hex, byte fields as 0x-hex.
    pub fn to_rpc_json(&self) -> Value {
        serde_json::json!({
            "sender": fmt_address(self.sender),
            "nonce": fmt_u256(self.nonce),
            "initCode": fmt_bytes(&self.init_code),
            "callData": fmt_bytes(&self.call_data),
            "callGasLimit": fmt_u256(self.call_gas_limit),
            "verificationGasLimit": fmt_u256(self.verification_gas_limit),
            "preVerificationGas": fmt_u256(self.pre_verification_gas),
            "maxFeePerGas": fmt_u256(self.max_fee_per_gas),
            "maxPriorityFeePerGas": fmt_u256(self.max_priority_fee_per_gas),
            "paymasterAndData": fmt_bytes(&self.paymaster_and_data),
            "signature": fmt_bytes(&self.signature),
        })
    }

    /// Tuple matching the Solidity struct layout, for calling
    /// `EntryPoint.getUserOpHash((...))`.
    #[allow(clippy::type_complexity)]
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }
}

/// One entry of the paymaster's ERC-20 fee-quote list.
///
/// `maxGasFee` and `premiumPercentage` are display-unit floats in the service
/// response; they are only ever logged here, never used in on-chain math.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    pub symbol: String,
    #[serde(alias = "decimal")]
    pub decimals: u8,
    pub token_address: Address,
    pub max_gas_fee: f64,
    #[serde(default)]
    pub premium_percentage: f64,
    #[serde(default)]
    pub valid_until: Option<u64>,
}

/// Parsed `pm_getFeeQuoteOrData` response.
///
/// The spender is absent when the service returns no quotes, so it stays
/// optional here; the transfer flow requires it only after a quote has been
/// selected.
#[derive(Debug, Clone)]
pub struct FeeQuotes {
    pub quotes: Vec<FeeQuote>,
    pub token_paymaster_address: Option<Address>,
}

/// Parsed `pm_sponsorUserOperation` response.
///
/// Gas limits are the ones the paymaster signed over; when present they must
/// replace the bundler estimates in the operation.
#[derive(Debug, Clone)]
pub struct SponsorshipData {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
}

#[cfg(test)]
mod tests {
    use super::UserOperation;
    use ethers::types::{Address, Bytes, U256};

    fn sample_op() -> UserOperation {
        UserOperation {
            sender: Address::from_low_u64_be(0x11),
            nonce: U256::from(7u64),
            init_code: Bytes::from(vec![0xaa, 0xbb]),
            call_data: Bytes::from(vec![0x01]),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(200_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster_and_data: Bytes::new(),
            signature: Bytes::from(vec![0u8; 65]),
        }
    }

    #[test]
    fn rpc_json_uses_camel_case_quantities() {
        let v = sample_op().to_rpc_json();
        assert_eq!(v["nonce"], "0x7");
        assert_eq!(v["callGasLimit"], "0x186a0");
        assert_eq!(v["initCode"], "0xaabb");
        assert_eq!(v["paymasterAndData"], "0x");
        assert_eq!(
            v["sender"],
            "0x0000000000000000000000000000000000000011"
        );
    }

    #[test]
    fn abi_tuple_preserves_field_order() {
        let op = sample_op();
        let t = op.as_abi_tuple();
        assert_eq!(t.0, op.sender);
        assert_eq!(t.1, op.nonce);
        assert_eq!(t.4, op.call_gas_limit);
        assert_eq!(t.10, op.signature);
    }
}
