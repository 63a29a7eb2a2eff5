//! Error taxonomy shared by the CLI runner and the HTTP bridge.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Anthropic-style error categories surfaced on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequestError,
    AuthenticationError,
    NotFoundError,
    TimeoutError,
    ApiError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequestError => "invalid_request_error",
            Self::AuthenticationError => "authentication_error",
            Self::NotFoundError => "not_found_error",
            Self::TimeoutError => "timeout_error",
            Self::ApiError => "api_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequestError => 400,
            Self::AuthenticationError => 401,
            Self::NotFoundError => 404,
            Self::TimeoutError => 504,
            Self::ApiError => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
}

/// Error envelope, `{"type":"error","error":{"type":..,"message":..}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: ErrorDetail,
}

impl ErrorBody {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            error: ErrorDetail {
                error_type,
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("{message}")]
    Unauthorized { message: String },
    /// Raised before any subprocess is spawned.
    #[error("{message}")]
    Configuration { message: String },
    #[error("failed to launch Claude CLI at {cli_path}: {message}")]
    Launch { cli_path: String, message: String },
    #[error("Claude CLI timed out after {timeout_secs}s (terminated)")]
    Timeout { timeout_secs: u64 },
    #[error("Claude CLI failed (exit {exit_code}): {message}")]
    ProcessExit { exit_code: i32, message: String },
    /// The CLI exited cleanly but reported an error in its payload.
    #[error("Claude CLI error: {message}")]
    CliReported { message: String },
    #[error("Failed to parse CLI output: {message}. Output preview: {preview}")]
    OutputParse { message: String, preview: String },
    #[error("stream error: {message}")]
    Stream { message: String },
}

impl BridgeError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequestError,
            Self::Unauthorized { .. } => ErrorType::AuthenticationError,
            Self::Timeout { .. } => ErrorType::TimeoutError,
            Self::Configuration { .. }
            | Self::Launch { .. }
            | Self::ProcessExit { .. }
            | Self::CliReported { .. }
            | Self::OutputParse { .. }
            | Self::Stream { .. } => ErrorType::ApiError,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_type(), self.to_string())
    }
}
