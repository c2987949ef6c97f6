//! Outcome errors of a single remote call.
//!
//! [`RpcError`] is what a caller receives when a call does not produce a
//! result. Its wire form is [`ErrorBody`], carried in the `error` member of a
//! response envelope.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const TIMEOUT: i32 = -32604;

/// A single parameter-schema violation reported by a validator.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer to the offending part of the parameters (empty for the root).
    pub path: String,
    pub message: String,
}

impl Violation {
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Error member of a response envelope.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: i32,
    pub method: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Violation>>,
}

/// Why a call did not return a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcError {
    /// No handler is bound for the method on the server.
    MethodNotFound { method: String },
    /// The parameters were rejected by the method's validator.
    InvalidParams {
        method: String,
        violations: Vec<Violation>,
    },
    /// The handler failed or panicked.
    InternalError {
        method: String,
        message: String,
        stack: Option<String>,
    },
    /// No reply arrived before the client's deadline. The remote call may
    /// still complete; its reply is then discarded.
    Timeout { method: String },
}

impl RpcError {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            RpcError::MethodNotFound { .. } => METHOD_NOT_FOUND,
            RpcError::InvalidParams { .. } => INVALID_PARAMS,
            RpcError::InternalError { .. } => INTERNAL_ERROR,
            RpcError::Timeout { .. } => TIMEOUT,
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            RpcError::MethodNotFound { method }
            | RpcError::InvalidParams { method, .. }
            | RpcError::InternalError { method, .. }
            | RpcError::Timeout { method } => method,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            RpcError::MethodNotFound { .. } => "Method not found",
            RpcError::InvalidParams { .. } => "Invalid params",
            RpcError::InternalError { message, .. } => message,
            RpcError::Timeout { .. } => "Timeout",
        }
    }

    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            code: self.code(),
            method: self.method().to_string(),
            message: self.message().to_string(),
            stack: None,
            messages: None,
        };
        match self {
            RpcError::InvalidParams { violations, .. } => {
                body.messages = Some(violations.clone());
            }
            RpcError::InternalError { stack, .. } => body.stack.clone_from(stack),
            RpcError::MethodNotFound { .. } | RpcError::Timeout { .. } => {}
        }
        body
    }

    /// Rebuilds the error from its wire form. Codes outside the known set are
    /// reported as [`RpcError::InternalError`] with the remote message.
    #[must_use]
    pub fn from_body(body: ErrorBody) -> Self {
        let ErrorBody {
            code,
            method,
            message,
            stack,
            messages,
        } = body;
        match code {
            METHOD_NOT_FOUND => RpcError::MethodNotFound { method },
            INVALID_PARAMS => RpcError::InvalidParams {
                method,
                violations: messages.unwrap_or_default(),
            },
            TIMEOUT => RpcError::Timeout { method },
            INTERNAL_ERROR => RpcError::InternalError {
                method,
                message,
                stack,
            },
            _ => RpcError::InternalError {
                method,
                message: format!("{message} (code {code})"),
                stack,
            },
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.message(), self.code(), self.method())?;
        if let RpcError::InvalidParams { violations, .. } = self {
            for violation in violations {
                write!(f, "; {violation}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for ErrorBody {
    fn from(value: RpcError) -> Self {
        value.to_body()
    }
}

impl From<ErrorBody> for RpcError {
    fn from(value: ErrorBody) -> Self {
        RpcError::from_body(value)
    }
}
