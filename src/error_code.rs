//! 标准错误类型：把厂商错误类型与 HTTP 状态码归一化为统一的错误分类。
//!
//! Canonical error kinds.
//!
//! Vendors report failures with their own type strings (`ThrottlingException`,
//! `RESOURCE_EXHAUSTED`, `rate_limit_exceeded`, ...). This module collapses them
//! onto a small set of kinds carrying an HTTP status, an OpenAI-style type name
//! and the retry semantics used by the direct dispatcher.
//!
//! | Kind | Status | Retryable |
//! |------|--------|-----------|
//! | `InvalidRequest` | 400 | no |
//! | `Authentication` | 401 | no |
//! | `PermissionDenied` | 403 | no |
//! | `NotFound` | 404 | no |
//! | `RequestTooLarge` | 413 | no |
//! | `RateLimited` | 429 | yes |
//! | `ServerError` | 500 | yes |
//! | `BadGateway` | 502 | yes |
//! | `Overloaded` | 503 | yes |
//! | `Timeout` | 504 | yes |
//! | `Unknown` | 500 | no |

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    PermissionDenied,
    NotFound,
    RequestTooLarge,
    RateLimited,
    ServerError,
    BadGateway,
    Overloaded,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// OpenAI-style error type name used in canonical error bodies.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::Authentication => "authentication_error",
            Self::PermissionDenied => "permission_error",
            Self::NotFound => "not_found_error",
            Self::RequestTooLarge => "request_too_large",
            Self::RateLimited => "rate_limit_error",
            Self::ServerError => "server_error",
            Self::BadGateway => "bad_gateway",
            Self::Overloaded => "overloaded_error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown_error",
        }
    }

    #[inline]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Authentication => 401,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::RequestTooLarge => 413,
            Self::RateLimited => 429,
            Self::ServerError | Self::Unknown => 500,
            Self::BadGateway => 502,
            Self::Overloaded => 503,
            Self::Timeout => 504,
        }
    }

    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError
                | Self::BadGateway
                | Self::Overloaded
                | Self::Timeout
        )
    }

    /// Maps a vendor error type/code string onto a kind.
    ///
    /// Covers OpenAI-style snake case names, AWS exception names and Google
    /// RPC status names.
    pub fn from_vendor_type(vendor_type: &str) -> Option<Self> {
        let kind = match vendor_type {
            "invalid_request_error" | "invalid_request" | "ValidationException"
            | "INVALID_ARGUMENT" | "FAILED_PRECONDITION" => Self::InvalidRequest,
            "authentication_error" | "invalid_api_key" | "UnrecognizedClientException"
            | "UNAUTHENTICATED" => Self::Authentication,
            "permission_error" | "AccessDeniedException" | "PERMISSION_DENIED" => {
                Self::PermissionDenied
            }
            "not_found_error" | "model_not_found" | "ResourceNotFoundException" | "NOT_FOUND" => {
                Self::NotFound
            }
            "request_too_large" | "context_length_exceeded" => Self::RequestTooLarge,
            "rate_limit_error" | "rate_limit_exceeded" | "insufficient_quota"
            | "ThrottlingException" | "RESOURCE_EXHAUSTED" => Self::RateLimited,
            "server_error" | "api_error" | "InternalServerException" | "INTERNAL" => {
                Self::ServerError
            }
            "bad_gateway" => Self::BadGateway,
            "overloaded_error" | "ServiceUnavailableException" | "ModelNotReadyException"
            | "UNAVAILABLE" => Self::Overloaded,
            "timeout" | "ModelTimeoutException" | "DEADLINE_EXCEEDED" => Self::Timeout,
            _ => return None,
        };
        Some(kind)
    }

    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest,
            401 => Self::Authentication,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 | 504 => Self::Timeout,
            413 => Self::RequestTooLarge,
            429 => Self::RateLimited,
            500 => Self::ServerError,
            502 => Self::BadGateway,
            503 | 529 => Self::Overloaded,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
