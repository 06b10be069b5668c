//! Error taxonomy (C1): a single tagged error value carrying kind, code, cause,
//! retryability, and HTTP mapping, shared by every component in this crate.

use std::fmt;
use std::time::Duration;

/// High-level classification of a failure. Drives retry eligibility (C2),
/// circuit-breaker bookkeeping (C3), and the HTTP status mapping (C9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    Conflict,
    RateLimit,
    Timeout,
    Network,
    ExternalService,
    Database,
    Internal,
}

impl ErrorKind {
    /// Default retryability for this kind, per spec §4.1. Callers may
    /// override per-instance via [`AppError::with_retryable`].
    pub const fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::ExternalService
                | ErrorKind::Database
        )
    }

    /// HTTP status code this kind maps to in C9 responses.
    pub const fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Auth => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimit => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::Network => 502,
            ErrorKind::ExternalService => 502,
            ErrorKind::Database => 500,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Database => "database",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The single sum-type error value propagated end-to-end: normalized once at
/// the C4 boundary, passed upward unchanged through C7/C8, mapped to an HTTP
/// response exactly once in C9 (§7).
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    /// Stable machine-readable code, e.g. `CIRCUIT_OPEN`, `HIERARCHY_CYCLE`.
    pub code: String,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    pub details: Option<serde_json::Value>,
    retryable_override: Option<bool>,
}

impl AppError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            cause: None,
            details: None,
            retryable_override: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override this instance's retryability, independent of `kind`'s default.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable_override = Some(retryable);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable_override.unwrap_or_else(|| self.kind.default_retryable())
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    // Constructors for the common cases, named for what callers are doing
    // rather than restating the kind (matches the teacher's `is_timeout()`
    // style of reading intent off the type rather than a bare enum match).

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "VALIDATION", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn circuit_open(dependency: &str, failure_count: usize, open_duration: Duration) -> Self {
        Self::new(
            ErrorKind::ExternalService,
            "CIRCUIT_OPEN",
            format!(
                "circuit breaker for '{dependency}' is open ({failure_count} failures, open for {open_duration:?})"
            ),
        )
        .with_retryable(false)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "INTERNAL", message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "CANCELLED", message).with_retryable(false)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ErrorKind::Timeout
        } else if e.is_connect() {
            ErrorKind::Network
        } else if let Some(status) = e.status() {
            status_to_kind(status.as_u16())
        } else {
            ErrorKind::ExternalService
        };
        AppError::new(kind, "STORAGE_GATEWAY_ERROR", e.to_string()).with_cause(e)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::new(ErrorKind::Validation, "MALFORMED_JSON", e.to_string()).with_cause(e)
    }
}

/// Maps an upstream HTTP status (storage gateway response) to an [`ErrorKind`],
/// per §4.4: "HTTP 5xx/408/429 map to retryable Network/RateLimit/ExternalService;
/// 4xx map to non-retryable kinds".
pub fn status_to_kind(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::Validation,
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::ExternalService,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retryability_matches_table() {
        assert!(!ErrorKind::Validation.default_retryable());
        assert!(!ErrorKind::Auth.default_retryable());
        assert!(!ErrorKind::NotFound.default_retryable());
        assert!(!ErrorKind::Conflict.default_retryable());
        assert!(ErrorKind::RateLimit.default_retryable());
        assert!(ErrorKind::Timeout.default_retryable());
        assert!(ErrorKind::Network.default_retryable());
        assert!(ErrorKind::ExternalService.default_retryable());
        assert!(ErrorKind::Database.default_retryable());
        assert!(!ErrorKind::Internal.default_retryable());
    }

    #[test]
    fn http_status_table_matches_spec() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::RateLimit.http_status(), 429);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::Network.http_status(), 502);
        assert_eq!(ErrorKind::ExternalService.http_status(), 502);
        assert_eq!(ErrorKind::Database.http_status(), 500);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn retryable_override_wins_over_kind_default() {
        let err = AppError::new(ErrorKind::Network, "X", "boom").with_retryable(false);
        assert!(!err.is_retryable());

        let err = AppError::new(ErrorKind::Validation, "X", "boom").with_retryable(true);
        assert!(err.is_retryable());
    }

    #[test]
    fn circuit_open_is_not_retryable() {
        let err = AppError::circuit_open("storage", 5, Duration::from_secs(10));
        assert!(!err.is_retryable());
        assert_eq!(err.code, "CIRCUIT_OPEN");
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn status_to_kind_covers_table() {
        assert_eq!(status_to_kind(400), ErrorKind::Validation);
        assert_eq!(status_to_kind(401), ErrorKind::Auth);
        assert_eq!(status_to_kind(404), ErrorKind::NotFound);
        assert_eq!(status_to_kind(409), ErrorKind::Conflict);
        assert_eq!(status_to_kind(408), ErrorKind::Timeout);
        assert_eq!(status_to_kind(429), ErrorKind::RateLimit);
        assert_eq!(status_to_kind(503), ErrorKind::ExternalService);
        assert_eq!(status_to_kind(418), ErrorKind::Internal);
    }
}
