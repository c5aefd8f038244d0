use anyhow::{anyhow, Context, Result};
use serde_json::Value;

/// Perform a single JSON-RPC 2.0 call over HTTP and return the `result` value.
///
/// Both the bundler and the paymaster speak plain JSON-RPC without batching or
/// subscriptions, so one request helper covers both clients.
pub async fn call(http: &reqwest::Client, url: &str, method: &str, params: Value) -> Result<Value> {
    let req = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let resp = http
        .post(url)
        .json(&req)
        .send()
        .await
        .with_context(|| format!("POST {url} failed"))?;

    let status = resp.status();
    let body: Value = resp.json().await.context("failed to decode JSON-RPC body")?;

    if !status.is_success() {
        return Err(anyhow!("HTTP {}: {}", status, body));
    }

    if let Some(err) = body.get("error") {
        return Err(anyhow!("RPC error: {}", err));
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| anyhow!("missing result field"))
}
