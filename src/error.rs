//! Error taxonomy for the coordinator and its gateway seam

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{AssetPair, IdempotencyKey, RequestClass};

/// Failures an exchange gateway can report
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid nonce")]
    InvalidNonce,

    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("rejected: {0}")]
    Rejected(String),

    /// The request never reached the exchange
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    /// The request may have reached the exchange; outcome unknown
    #[error("request timed out")]
    Timeout,
}

impl GatewayError {
    /// True when the request provably was not delivered and can be resent
    pub fn is_undelivered(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Machine-checkable reason code for a rejected intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NonceRejected,
    RateLimited,
    CircuitOpen,
    InsufficientBalance,
    TooSmall,
    DuplicateInFlight,
    BalanceUnknown,
    NetworkError,
    OrderTimedOut,
    InvalidIntent,
    Persistence,
    Rejected,
}

/// Errors surfaced by the coordinator
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("nonce rejected by exchange after resync")]
    NonceRejected,

    #[error("{class} requests throttled, retry after {retry_after:?}")]
    RateLimited {
        class: RequestClass,
        retry_after: Duration,
    },

    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("insufficient {asset} balance: available {available}, required {required}")]
    InsufficientBalance {
        asset: String,
        available: Decimal,
        required: Decimal,
    },

    #[error("order size {size} below minimum {minimum} for {pair}")]
    TooSmall {
        pair: AssetPair,
        size: Decimal,
        minimum: Decimal,
    },

    #[error("an order for {0} is already in flight")]
    DuplicateInFlight(IdempotencyKey),

    #[error("balance for {asset} is unknown: {reason}")]
    BalanceUnknown { asset: String, reason: String },

    #[error("network error after {attempts} attempt(s): {message}")]
    NetworkError { attempts: u32, message: String },

    #[error("order for {0} timed out with unknown outcome")]
    OrderTimedOut(IdempotencyKey),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("exchange rejected order: {0}")]
    Rejected(String),
}

impl CoordinatorError {
    /// Map a gateway failure on a request of `class` after `attempts` tries
    pub fn from_gateway(err: GatewayError, class: RequestClass, attempts: u32) -> Self {
        match err {
            GatewayError::InvalidNonce => Self::NonceRejected,
            GatewayError::RateLimited { retry_after } => Self::RateLimited {
                class,
                retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
            },
            GatewayError::InsufficientFunds => Self::Rejected("insufficient funds".to_string()),
            GatewayError::Rejected(message) => Self::Rejected(message),
            GatewayError::Unavailable(message) => Self::NetworkError { attempts, message },
            GatewayError::Timeout => Self::NetworkError {
                attempts,
                message: "request timed out".to_string(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NonceRejected => ErrorKind::NonceRejected,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::TooSmall { .. } => ErrorKind::TooSmall,
            Self::DuplicateInFlight(_) => ErrorKind::DuplicateInFlight,
            Self::BalanceUnknown { .. } => ErrorKind::BalanceUnknown,
            Self::NetworkError { .. } => ErrorKind::NetworkError,
            Self::OrderTimedOut(_) => ErrorKind::OrderTimedOut,
            Self::InvalidIntent(_) => ErrorKind::InvalidIntent,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Rejected(_) => ErrorKind::Rejected,
        }
    }

    /// Whether the caller may resubmit the same intent.
    ///
    /// `CircuitOpen` is not retryable until its `retry_after` has elapsed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NonceRejected | Self::RateLimited { .. } | Self::NetworkError { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Structured form for logs and reports
    pub fn to_rejection(&self) -> Rejection {
        Rejection {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

/// Serializable rejection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    #[test]
    fn test_circuit_open_is_not_retryable_but_has_hint() {
        let err = CoordinatorError::CircuitOpen {
            retry_after: Duration::from_secs(5),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_quota_denial_is_retryable() {
        let err = CoordinatorError::RateLimited {
            class: RequestClass::Order,
            retry_after: Duration::from_millis(250),
        };
        assert!(err.is_retryable());
        let rejection = err.to_rejection();
        assert_eq!(rejection.kind, ErrorKind::RateLimited);
        assert_eq!(rejection.retry_after_ms, Some(250));
    }

    #[test]
    fn test_rejection_serializes_reason_code() {
        let key = IdempotencyKey {
            pair: AssetPair::new("XBT", "USD"),
            side: Side::Buy,
        };
        let json = serde_json::to_string(&CoordinatorError::DuplicateInFlight(key).to_rejection())
            .unwrap();
        assert!(json.contains("\"kind\":\"duplicate_in_flight\""));
        assert!(!json.contains("retry_after_ms"));
    }

    #[test]
    fn test_gateway_errors_map_to_taxonomy() {
        let err = CoordinatorError::from_gateway(
            GatewayError::Unavailable("connection reset".into()),
            RequestClass::Balance,
            3,
        );
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(err.to_string().contains("3 attempt"));

        let err = CoordinatorError::from_gateway(
            GatewayError::RateLimited { retry_after: None },
            RequestClass::Order,
            1,
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(
            CoordinatorError::from_gateway(GatewayError::InvalidNonce, RequestClass::Order, 1).kind(),
            ErrorKind::NonceRejected
        );
    }

    #[test]
    fn test_only_unavailable_is_undelivered() {
        assert!(GatewayError::Unavailable("connect refused".into()).is_undelivered());
        assert!(!GatewayError::Timeout.is_undelivered());
        assert!(!GatewayError::InvalidNonce.is_undelivered());
    }
}
