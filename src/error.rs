use crate::error_code::ErrorKind;
use crate::tokens::PricingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path that caused the error (e.g., "messages[2].content[0].image_url")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "bedrock_converter", "price_validator")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Vendor-facing failure, normalized to one shape regardless of which vendor
/// or transport produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("HTTP {status} ({error_type}): {message}")]
pub struct ChannelError {
    pub status: u16,
    pub error_type: String,
    pub message: String,
}

impl ChannelError {
    pub fn new(status: u16, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Build from an HTTP status alone, deriving the error type from the status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, ErrorKind::from_http_status(status).name(), message)
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_vendor_type(&self.error_type)
            .unwrap_or_else(|| ErrorKind::from_http_status(self.status))
    }

    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }
}

/// Unified error type for the gateway core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed canonical request; raised before any network call.
    #[error("Invalid argument: {message}{}", format_context(.context))]
    Argument {
        message: String,
        context: ErrorContext,
    },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new argument error with structured context
    pub fn argument_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Argument {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Error::Queue {
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Argument { context, .. } | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether the failure happened before anything was sent to the vendor.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Argument { .. })
    }

    /// Best-effort projection onto the channel error shape used in canonical
    /// error bodies and stream failure callbacks.
    pub fn to_channel_error(&self) -> ChannelError {
        match self {
            Error::Channel(e) => e.clone(),
            Error::Argument { .. } => {
                ChannelError::new(400, ErrorKind::InvalidRequest.name(), self.to_string())
            }
            Error::Transport(t) => {
                let kind = if t.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::BadGateway
                };
                ChannelError::new(kind.http_status(), kind.name(), t.to_string())
            }
            Error::Queue { message } => {
                ChannelError::new(503, ErrorKind::Overloaded.name(), message.clone())
            }
            Error::Serialization(e) => {
                ChannelError::new(502, ErrorKind::BadGateway.name(), e.to_string())
            }
            other => ChannelError::new(500, ErrorKind::ServerError.name(), other.to_string()),
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Error::Channel(e) => e.retryable(),
            Error::Transport(_) => true,
            _ => false,
        }
    }
}
