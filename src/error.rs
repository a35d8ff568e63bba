//! Error types for the fastllm API server
//!
//! This module defines all error types used throughout the gateway and the
//! mapping from each error kind to its OpenAI-compatible wire surface.

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error type for all gateway operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Request failed validation (bad JSON, out-of-range parameter, missing field)
    #[error("{message}")]
    Validation {
        /// Human-readable description of the problem
        message: String,
        /// Offending parameter name, if one can be identified
        param: Option<String>,
    },

    /// Missing or incorrect API key
    #[error("Incorrect API key provided. You can find your API key at https://platform.openai.com/account/api-keys.")]
    InvalidApiKey,

    /// Requested model is not served by this process
    #[error("The model `{0}` does not exist.")]
    ModelNotFound(String),

    /// Dev-only endpoint hit without --dev_mode
    #[error("Endpoint {0} is only available in dev mode. Start with --dev_mode flag.")]
    DevEndpointDisabled(&'static str),

    /// Engine launch or fetch failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// Chat template could not be parsed or rendered
    #[error("Template error: {reason}")]
    Template {
        /// Reason the template failed
        reason: String,
    },

    /// Startup failure (bind, invalid host, model file missing)
    #[error("{0}")]
    Startup(String),
}

impl ServerError {
    /// Build a validation error with a parameter name
    pub fn validation(message: impl Into<String>, param: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    /// Build a validation error without a parameter name
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            param: None,
        }
    }

    /// HTTP status code for this error kind
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::InvalidApiKey => 401,
            Self::ModelNotFound(_) | Self::DevEndpointDisabled(_) => 404,
            Self::Engine(_) | Self::Template { .. } | Self::Startup(_) => 500,
        }
    }

    /// OpenAI error `type` field
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::InvalidApiKey | Self::DevEndpointDisabled(_) => {
                "invalid_request_error"
            }
            Self::ModelNotFound(_) => "model_not_found",
            Self::Engine(_) | Self::Template { .. } | Self::Startup(_) => "internal_error",
        }
    }

    /// OpenAI error `param` field
    #[must_use]
    pub fn param(&self) -> Option<&str> {
        match self {
            Self::Validation { param, .. } => param.as_deref(),
            _ => None,
        }
    }

    /// OpenAI error `code` field
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidApiKey => Some("invalid_api_key"),
            _ => None,
        }
    }
}
