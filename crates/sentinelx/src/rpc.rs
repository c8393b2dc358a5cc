//! Thin async JSON-RPC HTTP client for the chain the guarded contracts live on.
//!
//! Reads go through exponential backoff retry with rate-limit awareness (HTTP
//! 429 + Retry-After). Writes (`eth_sendRawTransaction`) are attempted exactly
//! once; retrying a broadcast is an operator decision.

use std::time::Duration;

use ethereum_types::{Address, H256, U256};
use serde_json::{Value, json};

use crate::abi::{format_address, format_hash, parse_h256, parse_hex_bytes, to_hex};
use crate::error::RpcError;

/// Configuration for RPC client behavior.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Per-request timeout (default: 10s).
    pub timeout: Duration,
    /// TCP connect timeout (default: 5s).
    pub connect_timeout: Duration,
    /// Maximum retry attempts for transient errors on reads (default: 2).
    pub max_retries: u32,
    /// Base backoff duration, doubled on each retry (default: 500ms).
    pub base_backoff: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Mined transaction outcome as reported by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub success: bool,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EthRpcClient {
    http: reqwest::Client,
    url: String,
    config: RpcConfig,
}

impl EthRpcClient {
    pub fn new(url: &str) -> Self {
        Self::with_config(url, RpcConfig::default())
    }

    pub fn with_config(url: &str, config: RpcConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            url: url.to_string(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub async fn eth_call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let result = self
            .rpc_call(
                "eth_call",
                json!([{ "to": format_address(&to), "data": to_hex(data) }, "latest"]),
            )
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| RpcError::parse("eth_call", "result", "expected string"))?;
        parse_hex_bytes(raw).ok_or_else(|| RpcError::parse("eth_call", "result", "invalid hex"))
    }

    pub async fn eth_chain_id(&self) -> Result<u64, RpcError> {
        let result = self.rpc_call("eth_chainId", json!([])).await?;
        parse_u64("eth_chainId", &result)
    }

    pub async fn eth_get_transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        let result = self
            .rpc_call(
                "eth_getTransactionCount",
                json!([format_address(&address), "pending"]),
            )
            .await?;
        parse_u64("eth_getTransactionCount", &result)
    }

    pub async fn eth_gas_price(&self) -> Result<U256, RpcError> {
        let result = self.rpc_call("eth_gasPrice", json!([])).await?;
        parse_u256("eth_gasPrice", &result)
    }

    pub async fn eth_estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: &[u8],
    ) -> Result<u64, RpcError> {
        let result = self
            .rpc_call(
                "eth_estimateGas",
                json!([{
                    "from": format_address(&from),
                    "to": format_address(&to),
                    "data": to_hex(data),
                }]),
            )
            .await?;
        parse_u64("eth_estimateGas", &result)
    }

    /// Broadcast a signed transaction. Never retried.
    pub async fn eth_send_raw_transaction(&self, raw: &[u8]) -> Result<H256, RpcError> {
        let method = "eth_sendRawTransaction";
        let result = self
            .rpc_call_once(method, &request_body(method, json!([to_hex(raw)])))
            .await?;
        result
            .as_str()
            .and_then(parse_h256)
            .ok_or_else(|| RpcError::parse(method, "result", "expected 32-byte hash"))
    }

    /// `None` while the transaction is not yet mined.
    pub async fn eth_get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<ReceiptStatus>, RpcError> {
        let method = "eth_getTransactionReceipt";
        let result = self.rpc_call(method, json!([format_hash(&hash)])).await?;
        if result.is_null() {
            return Ok(None);
        }

        let status = result
            .get("status")
            .ok_or_else(|| RpcError::parse(method, "status", "missing status"))?;
        let success = parse_u64(method, status)? == 1;
        let block_number = match result.get("blockNumber") {
            Some(value) if !value.is_null() => Some(parse_u64(method, value)?),
            _ => None,
        };

        Ok(Some(ReceiptStatus {
            success,
            block_number,
        }))
    }

    /// Execute a JSON-RPC call with retry and backoff.
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = request_body(method, params);

        let max_attempts = self.config.max_retries + 1; // 1 initial + N retries
        let mut last_error: Option<RpcError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let exponential = self.config.base_backoff * 2u32.saturating_pow(attempt - 1);
                // Respect Retry-After header for 429s
                let backoff = last_error
                    .as_ref()
                    .and_then(RpcError::retry_after_secs)
                    .map(Duration::from_secs)
                    .unwrap_or(exponential);
                tokio::time::sleep(backoff).await;
            }

            match self.rpc_call_once(method, &body).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt + 1 >= max_attempts {
                        if attempt > 0 {
                            return Err(RpcError::RetryExhausted {
                                method: method.into(),
                                attempts: attempt + 1,
                                last_error: Box::new(error),
                            });
                        }
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .map(|error| RpcError::RetryExhausted {
                method: method.into(),
                attempts: max_attempts,
                last_error: Box::new(error),
            })
            .unwrap_or_else(|| RpcError::parse(method, "", "unknown error")))
    }

    /// Single attempt at an RPC call (no retry).
    async fn rpc_call_once(&self, method: &str, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    RpcError::Timeout {
                        method: method.into(),
                        elapsed_ms: u64::try_from(self.config.timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    }
                } else {
                    RpcError::ConnectionFailed {
                        url: self.url.clone(),
                        cause: error.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .map(|value| format!("retry-after:{value}"))
                .unwrap_or_default();

            let body_text = response.text().await.unwrap_or_default();
            let display_body = if retry_after.is_empty() {
                body_text
            } else {
                retry_after
            };

            return Err(RpcError::HttpError {
                method: method.into(),
                status: status.as_u16(),
                body: display_body,
            });
        }

        let json_response: Value = response
            .json()
            .await
            .map_err(|error| RpcError::parse(method, "response_body", error.to_string()))?;

        if let Some(error) = json_response.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(RpcError::JsonRpcError {
                method: method.into(),
                code,
                message,
            });
        }

        json_response
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::parse(method, "result", "missing result field"))
    }
}

fn request_body(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1
    })
}

fn parse_u64(method: &str, value: &Value) -> Result<u64, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::parse(method, "u64", "expected hex string"))?;
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|error| RpcError::parse(method, "u64", error.to_string()))
}

fn parse_u256(method: &str, value: &Value) -> Result<U256, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::parse(method, "u256", "expected hex string"))?;
    U256::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|error| RpcError::parse(method, "u256", format!("{error:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quantities() -> Result<(), RpcError> {
        assert_eq!(parse_u64("m", &json!("0x1a"))?, 26);
        assert_eq!(parse_u256("m", &json!("0x3b9aca00"))?, U256::from(1_000_000_000u64));
        assert!(parse_u64("m", &json!(26)).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_node_is_a_connection_failure() {
        let client = EthRpcClient::with_config(
            "http://127.0.0.1:9",
            RpcConfig {
                timeout: Duration::from_millis(500),
                connect_timeout: Duration::from_millis(200),
                max_retries: 0,
                base_backoff: Duration::from_millis(1),
            },
        );

        let result = client.eth_chain_id().await;
        assert!(matches!(
            result,
            Err(RpcError::ConnectionFailed { .. }) | Err(RpcError::Timeout { .. })
        ));
    }
}
