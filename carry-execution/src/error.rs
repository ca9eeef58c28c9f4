use crate::order::ValidationError;
use carry_instrument::exchange::ExchangeId;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of a venue API failure.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    RateLimit,
    NonceConflict,
    Timeout,
    NetworkError,
    ServiceUnavailable,
    Partial,
    SelfTradeRisk,
    UnknownError,
}

impl ApiErrorCode {
    /// Retryable codes are re-attempted (with protocol-defined waits) up to the configured
    /// retry budget; all others are terminal for the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiErrorCode::RateLimit
                | ApiErrorCode::NonceConflict
                | ApiErrorCode::Timeout
                | ApiErrorCode::NetworkError
                | ApiErrorCode::ServiceUnavailable
                | ApiErrorCode::Partial
        )
    }
}

/// Raw failure raised by a venue adapter, classified by [`AdapterError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("venue adapter error (status={http_status:?}): {message}")]
pub struct AdapterError {
    pub http_status: Option<u16>,
    pub message: String,
}

impl AdapterError {
    pub fn new(http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            message: message.into(),
        }
    }

    /// Classify the failure: HTTP 429 is a rate limit; a message mentioning "nonce" or
    /// "timestamp" is a nonce race; 5xx is service unavailability; connection wording is a
    /// network error.
    pub fn code(&self) -> ApiErrorCode {
        if self.http_status == Some(429) {
            return ApiErrorCode::RateLimit;
        }
        let message = self.message.to_lowercase();
        if message.contains("nonce") || message.contains("timestamp") {
            return ApiErrorCode::NonceConflict;
        }
        if matches!(self.http_status, Some(status) if (500..600).contains(&status)) {
            return ApiErrorCode::ServiceUnavailable;
        }
        if message.contains("timed out") || message.contains("timeout") {
            return ApiErrorCode::Timeout;
        }
        if message.contains("connection") || message.contains("network") {
            return ApiErrorCode::NetworkError;
        }
        ApiErrorCode::UnknownError
    }
}

/// All execution-layer errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("executor is paused")]
    Paused,

    #[error("no enabled account available for {0}")]
    NoAccount(ExchangeId),

    #[error("own-order self-trade risk on {exchange} {symbol}")]
    SelfTradeRisk { exchange: ExchangeId, symbol: String },

    #[error("execution timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("venue error [{code}] after {attempts} attempt(s): {source}")]
    Api {
        code: ApiErrorCode,
        attempts: u32,
        source: AdapterError,
    },

    #[error("order was rejected by the venue: {reason}")]
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_classification() {
        struct TestCase {
            error: AdapterError,
            expected: ApiErrorCode,
        }

        let tests = vec![
            TestCase {
                // TC0: HTTP 429
                error: AdapterError::new(Some(429), "Too many requests"),
                expected: ApiErrorCode::RateLimit,
            },
            TestCase {
                // TC1: nonce wording
                error: AdapterError::new(Some(400), "Nonce is too small"),
                expected: ApiErrorCode::NonceConflict,
            },
            TestCase {
                // TC2: timestamp wording
                error: AdapterError::new(None, "Timestamp for this request is outside recvWindow"),
                expected: ApiErrorCode::NonceConflict,
            },
            TestCase {
                // TC3: 5xx
                error: AdapterError::new(Some(503), "Service unavailable"),
                expected: ApiErrorCode::ServiceUnavailable,
            },
            TestCase {
                // TC4: network wording
                error: AdapterError::new(None, "connection reset by peer"),
                expected: ApiErrorCode::NetworkError,
            },
            TestCase {
                // TC5: unknown
                error: AdapterError::new(Some(400), "Invalid symbol"),
                expected: ApiErrorCode::UnknownError,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.error.code(), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_retryability() {
        assert!(ApiErrorCode::RateLimit.is_retryable());
        assert!(ApiErrorCode::Timeout.is_retryable());
        assert!(ApiErrorCode::NonceConflict.is_retryable());
        assert!(!ApiErrorCode::UnknownError.is_retryable());
        assert!(!ApiErrorCode::SelfTradeRisk.is_retryable());
    }
}
