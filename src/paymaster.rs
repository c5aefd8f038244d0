use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, U256};
use serde_json::Value;

use crate::encoding::{fmt_address, parse_bytes_hex, parse_u256_quantity};
use crate::jsonrpc;
use crate::types::{FeeQuote, FeeQuotes, SponsorshipData};

/// Token paymaster web service client.
///
/// The service quotes the gas cost of a UserOperation in an ERC-20 token
/// (`pm_getFeeQuoteOrData`) and, once the operation carries an allowance for
/// its spender, signs sponsorship data for it (`pm_sponsorUserOperation`).
#[derive(Debug, Clone)]
pub struct TokenPaymasterClient {
    url: String,
    http: reqwest::Client,
}

impl TokenPaymasterClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    /// Ask for ERC-20 fee quotes for `user_op`, preferring `preferred_token`.
    ///
    /// An empty token list means "quote every token you support"; callers pick
    /// from whatever comes back (in practice the first entry).
    pub async fn get_fee_quotes(&self, user_op: Value, preferred_token: Address) -> Result<FeeQuotes> {
        let params = serde_json::json!([
            user_op,
            {
                "mode": "ERC20",
                "tokenInfo": {
                    "tokenList": [],
                    "preferredToken": fmt_address(preferred_token),
                },
            }
        ]);
        let res = jsonrpc::call(&self.http, &self.url, "pm_getFeeQuoteOrData", params)
            .await
            .context("pm_getFeeQuoteOrData RPC failed")?;
        parse_fee_quotes(&res)
    }

    /// Request signed sponsorship data for `user_op`, paying fees in `fee_token`.
    ///
    /// `calculateGasLimits` asks the service to return the gas limits it signed
    /// over; when present they must overwrite the bundler estimates.
    pub async fn sponsor_user_operation(
        &self,
        user_op: Value,
        fee_token: Address,
    ) -> Result<SponsorshipData> {
        let params = serde_json::json!([
            user_op,
            {
                "mode": "ERC20",
                "tokenInfo": {
                    "feeTokenAddress": fmt_address(fee_token),
                },
                "calculateGasLimits": true,
            }
        ]);
        let res = jsonrpc::call(&self.http, &self.url, "pm_sponsorUserOperation", params)
            .await
            .context("pm_sponsorUserOperation RPC failed")?;
        parse_sponsorship(&res)
    }
}

fn parse_fee_quotes(result: &Value) -> Result<FeeQuotes> {
    // A missing or null feeQuotes field is treated the same as an empty list;
    // the caller decides whether that is fatal.
    let quotes: Vec<FeeQuote> = match result.get("feeQuotes") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v.clone()).context("malformed feeQuotes entry")?,
    };

    // SDK responses call the spender tokenPaymasterAddress; the raw service
    // response calls it paymasterAddress. Accept both.
    let token_paymaster_address = match result
        .get("tokenPaymasterAddress")
        .or_else(|| result.get("paymasterAddress"))
    {
        None | Some(Value::Null) => None,
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| anyhow!("tokenPaymasterAddress is not a string"))?;
            Some(
                s.parse::<Address>()
                    .map_err(|e| anyhow!("invalid tokenPaymasterAddress '{s}': {e}"))?,
            )
        }
    };

    Ok(FeeQuotes {
        quotes,
        token_paymaster_address,
    })
}

fn parse_sponsorship(result: &Value) -> Result<SponsorshipData> {
    let pm = result
        .get("paymasterAndData")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing paymasterAndData field"))?;
    let paymaster_and_data = parse_bytes_hex(pm).context("invalid hex in paymasterAndData")?;

    Ok(SponsorshipData {
        paymaster_and_data,
        call_gas_limit: opt_quantity(result, "callGasLimit")?,
        verification_gas_limit: opt_quantity(result, "verificationGasLimit")?,
        pre_verification_gas: opt_quantity(result, "preVerificationGas")?,
    })
}

/// Gas limits come back as 0x-hex strings, decimal strings, or bare JSON
/// numbers depending on the service. Accept all three.
fn opt_quantity(v: &Value, key: &str) -> Result<Option<U256>> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let parsed = if s.starts_with("0x") {
                parse_u256_quantity(s)
            } else {
                U256::from_dec_str(s).map_err(|e| anyhow!("{e}"))
            };
            parsed
                .with_context(|| format!("invalid quantity in field {key}: '{s}'"))
                .map(Some)
        }
        Some(Value::Number(n)) => {
            let n = n
                .as_u64()
                .ok_or_else(|| anyhow!("field {key} is not an unsigned integer"))?;
            Ok(Some(U256::from(n)))
        }
        Some(other) => Err(anyhow!("unexpected JSON type for field {key}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_fee_quotes, parse_sponsorship};
    use ethers::types::{Bytes, U256};
    use serde_json::json;

    const SPENDER: &str = "0x00000f7365ca6c59a2c93719ad53d567ed49c14c";

    fn quotes_response() -> serde_json::Value {
        json!({
            "mode": "ERC20",
            "paymasterAddress": SPENDER,
            "feeQuotes": [
                {
                    "symbol": "USDC",
                    "decimal": 6,
                    "tokenAddress": "0x036cbd53842c5426634e7929541ec2318f3dcf7e",
                    "maxGasFee": 0.327,
                    "premiumPercentage": 12.5,
                    "validUntil": 1700000000u64
                },
                {
                    "symbol": "DAI",
                    "decimal": 18,
                    "tokenAddress": "0x7683022d84f726a96c4a6611cd31dbf5409c0ac9",
                    "maxGasFee": 0.331
                }
            ]
        })
    }

    #[test]
    fn parses_quotes_and_spender() {
        let fq = parse_fee_quotes(&quotes_response()).unwrap();
        assert_eq!(fq.quotes.len(), 2);
        assert_eq!(fq.quotes[0].symbol, "USDC");
        assert_eq!(fq.quotes[0].decimals, 6);
        assert_eq!(fq.quotes[0].valid_until, Some(1700000000));
        assert_eq!(fq.quotes[1].premium_percentage, 0.0);
        assert_eq!(
            crate::encoding::fmt_address(fq.token_paymaster_address.unwrap()),
            SPENDER
        );
    }

    #[test]
    fn spender_also_accepted_under_sdk_field_name() {
        let res = json!({ "tokenPaymasterAddress": SPENDER, "feeQuotes": [] });
        let fq = parse_fee_quotes(&res).unwrap();
        assert!(fq.quotes.is_empty());
        assert!(fq.token_paymaster_address.is_some());
    }

    #[test]
    fn missing_quote_list_is_empty_not_error() {
        let fq = parse_fee_quotes(&json!({ "mode": "ERC20" })).unwrap();
        assert!(fq.quotes.is_empty());
        assert!(fq.token_paymaster_address.is_none());
    }

    #[test]
    fn malformed_quote_entry_is_an_error() {
        let res = json!({ "feeQuotes": [ { "symbol": "USDC" } ] });
        assert!(parse_fee_quotes(&res).is_err());
    }

    #[test]
    fn parses_sponsorship_with_hex_limits() {
        let res = json!({
            "paymasterAndData": "0xdeadbeef",
            "callGasLimit": "0x186a0",
            "verificationGasLimit": "0x30d40",
            "preVerificationGas": "0xc350"
        });
        let s = parse_sponsorship(&res).unwrap();
        assert_eq!(s.paymaster_and_data, Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(s.call_gas_limit, Some(U256::from(100_000u64)));
        assert_eq!(s.verification_gas_limit, Some(U256::from(200_000u64)));
        assert_eq!(s.pre_verification_gas, Some(U256::from(50_000u64)));
    }

    #[test]
    fn parses_sponsorship_with_decimal_and_numeric_limits() {
        let res = json!({
            "paymasterAndData": "0xdeadbeef",
            "callGasLimit": "100000",
            "preVerificationGas": 50000
        });
        let s = parse_sponsorship(&res).unwrap();
        assert_eq!(s.call_gas_limit, Some(U256::from(100_000u64)));
        assert_eq!(s.verification_gas_limit, None);
        assert_eq!(s.pre_verification_gas, Some(U256::from(50_000u64)));
    }

    #[test]
    fn sponsorship_requires_paymaster_and_data() {
        let res = json!({ "callGasLimit": "0x1" });
        assert!(parse_sponsorship(&res).is_err());
    }

    #[test]
    fn sponsorship_rejects_bad_hex() {
        let res = json!({ "paymasterAndData": "0xzz" });
        assert!(parse_sponsorship(&res).is_err());
    }
}
