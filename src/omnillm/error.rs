//! Error taxonomy shared across the runtime.
//!
//! Every fallible operation in the crate returns [`AiError`].  The variants
//! mirror the failure categories a caller can meaningfully react to: bad
//! input, missing configuration, transport failures, provider rejections,
//! tool problems, and schema mismatches.
//!
//! Errors raised inside event handlers and audit stores are never surfaced
//! to the request path; they are logged and swallowed (see
//! [`crate::omnillm::event`] and [`crate::omnillm::audit`]).

use std::error::Error;
use std::fmt;

/// Unified error type for all OmniLLM operations.
#[derive(Debug, Clone)]
pub enum AiError {
    /// Malformed message, unknown role, empty content, or other bad input.
    InvalidArgument(String),
    /// No API key (or credential set) could be resolved for the selected provider.
    ConfigMissing(String),
    /// The HTTP deadline was exceeded.  Partial stream data delivered before
    /// the abort remains visible to the chunk callback.
    Timeout {
        /// The deadline that was exceeded, in seconds.
        seconds: u64,
    },
    /// The provider answered HTTP 429.
    RateLimited {
        /// Provider that rejected the request.
        provider: String,
        /// Parsed `Retry-After` value in seconds, when the provider sent one.
        retry_after: Option<u64>,
    },
    /// The provider answered 4xx/5xx with a decodable body.
    Provider {
        /// HTTP status code returned by the provider.
        status: u16,
        /// Provider-supplied error message.
        message: String,
    },
    /// Non-JSON response body or a malformed event-stream frame.
    Protocol(String),
    /// An agent asked for a tool that is absent from its registry.
    ///
    /// The agent loop does not abort on this; it synthesizes a tool-result
    /// message carrying the error text instead.  The variant exists for
    /// direct registry invocations.
    ToolNotFound(String),
    /// A tool callable failed.
    ToolExecution {
        /// Name of the failing tool.
        tool: String,
        /// Message from the underlying failure.
        message: String,
    },
    /// A provider response could not be populated into the requested
    /// structured-output target.
    SchemaViolation(String),
    /// The selected provider does not implement the requested capability
    /// (e.g. embeddings on Claude, chat on Voyage).
    Unsupported {
        /// Provider lacking the capability.
        provider: String,
        /// The operation that was attempted (`"chat"`, `"embed"`, ...).
        operation: String,
    },
    /// An audit store write failed.  Never propagated to the request path.
    Audit(String),
}

impl fmt::Display for AiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            AiError::ConfigMissing(msg) => write!(f, "Missing configuration: {}", msg),
            AiError::Timeout { seconds } => {
                write!(f, "Request timed out after {} seconds", seconds)
            }
            AiError::RateLimited {
                provider,
                retry_after,
            } => match retry_after {
                Some(secs) => write!(
                    f,
                    "Rate limited by {} (retry after {} seconds)",
                    provider, secs
                ),
                None => write!(f, "Rate limited by {}", provider),
            },
            AiError::Provider { status, message } => {
                write!(f, "Provider error (HTTP {}): {}", status, message)
            }
            AiError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AiError::ToolNotFound(name) => write!(f, "Tool not found: {}", name),
            AiError::ToolExecution { tool, message } => {
                write!(f, "Tool '{}' failed: {}", tool, message)
            }
            AiError::SchemaViolation(msg) => write!(f, "Schema violation: {}", msg),
            AiError::Unsupported {
                provider,
                operation,
            } => write!(f, "Provider '{}' does not support {}", provider, operation),
            AiError::Audit(msg) => write!(f, "Audit store error: {}", msg),
        }
    }
}

impl Error for AiError {}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured deadline; callers that
            // know it re-wrap with the precise value.
            AiError::Timeout { seconds: 0 }
        } else if let Some(status) = err.status() {
            AiError::Provider {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            AiError::Protocol(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AiError {
    fn from(err: serde_json::Error) -> Self {
        AiError::Protocol(format!("JSON decode failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_provider_and_retry() {
        let err = AiError::RateLimited {
            provider: "openai".into(),
            retry_after: Some(30),
        };
        let text = err.to_string();
        assert!(text.contains("openai"));
        assert!(text.contains("30"));
    }

    #[test]
    fn display_unsupported_names_operation() {
        let err = AiError::Unsupported {
            provider: "voyage".into(),
            operation: "chat".into(),
        };
        assert_eq!(err.to_string(), "Provider 'voyage' does not support chat");
    }
}
