//! Error model shared by every surface of the gateway.
//!
//! Errors carry a closed kind plus a human-readable message. Callers match on
//! the kind; messages are for logs and clients only. Each kind maps to a
//! stable envelope code (non-zero; `0` means success) and an HTTP status.

use hyper::StatusCode;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MiddlewareError>;

/// The closed set of error kinds the middleware can produce.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no route: {0}")]
    RouteNotFound(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("frame body of {got} bytes exceeds limit of {limit}")]
    Oversize { got: usize, limit: usize },

    #[error("frame checksum mismatch: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unsupported frame version {0}")]
    BadMagic(u8),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("pool closed: {0}")]
    PoolClosed(String),

    #[error("level-2 cache unavailable: {0}")]
    L2Unavailable(String),

    #[error("circuit breaker open: {0}")]
    BreakerOpen(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MiddlewareError {
    /// Stable non-zero code used in the response envelope.
    pub fn code(&self) -> i32 {
        match self {
            Self::BadRequest(_) => 1001,
            Self::Unauthenticated(_) => 1002,
            Self::Forbidden(_) => 1003,
            Self::NotFound(_) => 1004,
            Self::Conflict(_) => 1005,
            Self::RouteNotFound(_) => 1006,
            Self::ProtocolViolation(_) => 2001,
            Self::Oversize { .. } => 2002,
            Self::ChecksumMismatch { .. } => 2003,
            Self::Truncated { .. } => 2004,
            Self::BadMagic(_) => 2005,
            Self::Timeout(_) => 3001,
            Self::Cancelled(_) => 3002,
            Self::PoolExhausted(_) => 3003,
            Self::PoolClosed(_) => 3004,
            Self::L2Unavailable(_) => 3005,
            Self::BreakerOpen(_) => 3006,
            Self::Storage(_) => 4001,
            Self::Internal(_) => 5000,
        }
    }

    /// HTTP status for this kind.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::ProtocolViolation(_)
            | Self::Oversize { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Truncated { .. }
            | Self::BadMagic(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout(_) | Self::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PoolExhausted(_)
            | Self::PoolClosed(_)
            | Self::L2Unavailable(_)
            | Self::BreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient kinds are retried at most once at the boundary where they
    /// are recoverable (cache manager for L2, storage adapter for storage).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::L2Unavailable(_) | Self::BreakerOpen(_)
        )
    }

    /// Protocol-level decode failures are fatal to a TCP session.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::Oversize { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Truncated { .. }
                | Self::BadMagic(_)
        )
    }
}

impl From<std::io::Error> for MiddlewareError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for MiddlewareError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(format!("invalid json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_and_nonzero() {
        let errs = [
            MiddlewareError::BadRequest("x".into()),
            MiddlewareError::Unauthenticated("x".into()),
            MiddlewareError::RouteNotFound("x".into()),
            MiddlewareError::Internal("x".into()),
        ];
        for e in errs {
            assert_ne!(e.code(), 0);
        }
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(
            MiddlewareError::Unauthenticated("t".into()).http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            MiddlewareError::RouteNotFound("t".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MiddlewareError::L2Unavailable("t".into()).http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            MiddlewareError::Conflict("t".into()).http_status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(MiddlewareError::Timeout("t".into()).is_transient());
        assert!(MiddlewareError::BreakerOpen("t".into()).is_transient());
        assert!(!MiddlewareError::Storage("t".into()).is_transient());
    }
}
