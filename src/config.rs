use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    /// Optional name of an environment variable holding the RPC URL, so the
    /// artifact can be committed without a provider API key in it.
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub token: String,
    #[serde(default)]
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub token: ethers::types::Address,
    /// Artifact-declared token decimals, cross-checked against the on-chain
    /// value at transfer time.
    pub decimals: Option<u8>,
}

pub fn load_deployment(path: &Path, rpc_override: Option<String>) -> Result<Deployment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment json at {}", path.display()))?;
    parse_deployment(&raw, rpc_override)
        .with_context(|| format!("invalid deployment json at {}", path.display()))
}

fn parse_deployment(raw: &str, rpc_override: Option<String>) -> Result<Deployment> {
    let raw: DeploymentRaw =
        serde_json::from_str(raw).context("failed to parse deployment json")?;

    // Resolution order: explicit override, env indirection, artifact literal.
    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let token = raw
        .token
        .parse::<ethers::types::Address>()
        .map_err(|e| anyhow!("invalid token address '{}': {e}", raw.token))?;

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        token,
        decimals: raw.decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_deployment;

    const ARTIFACT: &str = r#"{
        "chainId": 84532,
        "rpc": "https://sepolia.base.org",
        "token": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
        "decimals": 6
    }"#;

    #[test]
    fn parses_minimal_artifact() {
        let dep = parse_deployment(ARTIFACT, None).unwrap();
        assert_eq!(dep.chain_id, 84532);
        assert_eq!(dep.rpc_url, "https://sepolia.base.org");
        assert_eq!(dep.decimals, Some(6));
        assert_eq!(
            crate::encoding::fmt_address(dep.token),
            "0x036cbd53842c5426634e7929541ec2318f3dcf7e"
        );
    }

    #[test]
    fn rpc_override_wins_over_artifact() {
        let dep = parse_deployment(ARTIFACT, Some("http://localhost:8545".into())).unwrap();
        assert_eq!(dep.rpc_url, "http://localhost:8545");
    }

    #[test]
    fn rpc_env_var_indirection_falls_back_to_literal_when_unset() {
        let raw = r#"{
            "chainId": 1,
            "rpc": "https://fallback.example",
            "rpcEnvVar": "TOKENSEND_AA_TEST_UNSET_RPC_VAR",
            "token": "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
        }"#;
        let dep = parse_deployment(raw, None).unwrap();
        assert_eq!(dep.rpc_url, "https://fallback.example");
        assert_eq!(dep.decimals, None);
    }

    #[test]
    fn rejects_bad_token_address() {
        let raw = r#"{
            "chainId": 1,
            "rpc": "https://example",
            "token": "not-an-address"
        }"#;
        assert!(parse_deployment(raw, None).is_err());
    }
}
