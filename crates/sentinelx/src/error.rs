//! Error types for the JSON-RPC chain client.

/// Structured JSON-RPC error types for programmatic handling.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("Connection to {url} failed: {cause}")]
    ConnectionFailed { url: String, cause: String },

    #[error("{method} timed out after {elapsed_ms}ms")]
    Timeout { method: String, elapsed_ms: u64 },

    #[error("{method} HTTP {status}: {body}")]
    HttpError {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method} JSON-RPC error {code}: {message}")]
    JsonRpcError {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method} response parse error in {field}: {cause}")]
    ParseError {
        method: String,
        field: String,
        cause: String,
    },

    #[error("{method} failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        method: String,
        attempts: u32,
        last_error: Box<RpcError>,
    },
}

impl RpcError {
    /// Whether this error is likely transient and retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::ConnectionFailed { .. } => true,
            RpcError::Timeout { .. } => true,
            RpcError::HttpError { status, .. } => {
                // 429 = rate limited, 502/503/504 = server issues
                matches!(*status, 429 | 502 | 503 | 504)
            }
            RpcError::JsonRpcError { .. } => false,
            RpcError::ParseError { .. } => false,
            RpcError::RetryExhausted { .. } => false,
        }
    }

    /// Whether the failure was a deadline rather than a refusal.
    pub fn is_timeout(&self) -> bool {
        match self {
            RpcError::Timeout { .. } => true,
            RpcError::RetryExhausted { last_error, .. } => last_error.is_timeout(),
            _ => false,
        }
    }

    /// For HTTP 429, extract Retry-After header value (if available).
    pub fn retry_after_secs(&self) -> Option<u64> {
        // Retry-After is captured in the body field as a hint
        if let RpcError::HttpError {
            status: 429, body, ..
        } = self
        {
            body.strip_prefix("retry-after:")
                .and_then(|s| s.trim().parse().ok())
        } else {
            None
        }
    }

    /// Stable short code recorded in telemetry.
    pub fn code(&self) -> &'static str {
        if self.is_timeout() {
            "rpc_timeout"
        } else {
            "rpc_error"
        }
    }

    pub fn parse(method: &str, field: &str, cause: impl Into<String>) -> Self {
        RpcError::ParseError {
            method: method.to_owned(),
            field: field.to_owned(),
            cause: cause.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_gateway_errors_are_retryable() {
        for status in [429u16, 502, 503, 504] {
            let error = RpcError::HttpError {
                method: "eth_call".into(),
                status,
                body: String::new(),
            };
            assert!(error.is_retryable(), "status {status}");
        }

        let error = RpcError::HttpError {
            method: "eth_call".into(),
            status: 400,
            body: String::new(),
        };
        assert!(!error.is_retryable());
    }

    #[test]
    fn retry_after_hint_is_parsed() {
        let error = RpcError::HttpError {
            method: "eth_call".into(),
            status: 429,
            body: "retry-after: 7".into(),
        };
        assert_eq!(error.retry_after_secs(), Some(7));
    }

    #[test]
    fn exhausted_timeouts_keep_their_code() {
        let error = RpcError::RetryExhausted {
            method: "eth_call".into(),
            attempts: 3,
            last_error: Box::new(RpcError::Timeout {
                method: "eth_call".into(),
                elapsed_ms: 5_000,
            }),
        };
        assert!(error.is_timeout());
        assert_eq!(error.code(), "rpc_timeout");
    }
}
