use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::time::Duration;

use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity};
use crate::jsonrpc;

/// ERC-4337 bundler JSON-RPC client (EntryPoint v0.6 methods).
#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = jsonrpc::call(&self.http, &self.url, "eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;

        Ok(GasEstimates {
            call_gas_limit: quantity_field(&res, "callGasLimit")?,
            verification_gas_limit: quantity_field(&res, "verificationGasLimit")?,
            pre_verification_gas: quantity_field(&res, "preVerificationGas")?,
        })
    }

    pub async fn send_user_operation(&self, user_op: Value, entrypoint: Address) -> Result<H256> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = jsonrpc::call(&self.http, &self.url, "eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Poll for the operation receipt until it appears or `timeout` elapses.
    /// A zero timeout disables the deadline.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<Value> {
        let start = std::time::Instant::now();
        loop {
            if timeout.as_secs() > 0 && start.elapsed() > timeout {
                return Err(anyhow!(
                    "timed out waiting for userOp receipt after {:?}",
                    timeout
                ));
            }

            let params = serde_json::json!([fmt_h256(user_op_hash)]);
            match jsonrpc::call(&self.http, &self.url, "eth_getUserOperationReceipt", params).await
            {
                Ok(v) if !v.is_null() => return Ok(v),
                Ok(_) => {}
                Err(e) => {
                    // transient errors are common on free-tier bundlers; keep polling
                    tracing::warn!(error = %e, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
    }
}

fn quantity_field(v: &Value, key: &str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u256_quantity(s)
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash as a bare JSON string; some wrap it
    // in an object under varying key names. Accept the known shapes.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::{parse_userop_hash, quantity_field};
    use crate::encoding::parse_h256;
    use ethers::types::U256;
    use serde_json::json;

    const HASH: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

    #[test]
    fn userop_hash_from_bare_string() {
        let hash = parse_userop_hash(&json!(HASH)).unwrap();
        assert_eq!(hash, parse_h256(HASH).unwrap());
    }

    #[test]
    fn userop_hash_from_wrapped_objects() {
        for key in ["result", "userOpHash", "userOperationHash"] {
            let hash = parse_userop_hash(&json!({ key: HASH })).unwrap();
            assert_eq!(hash, parse_h256(HASH).unwrap());
        }
    }

    #[test]
    fn userop_hash_rejects_unknown_shape() {
        assert!(parse_userop_hash(&json!({ "foo": "bar" })).is_err());
    }

    #[test]
    fn estimate_fields_are_hex_quantities() {
        let res = json!({ "callGasLimit": "0x186a0" });
        assert_eq!(
            quantity_field(&res, "callGasLimit").unwrap(),
            U256::from(100_000u64)
        );
        assert!(quantity_field(&res, "verificationGasLimit").is_err());
    }
}
