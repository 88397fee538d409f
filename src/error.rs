//! # Error handling utilities.
//! Infrastructure code (configuration, startup, radio drivers) uses the
//! generic anyhow error type. Everything that crosses the message channel is
//! a [`UwbError`], which always has the structured `(code, message, details)`
//! wire shape.

use thiserror::Error;

use crate::codec::{CodecError, Value};
use crate::model::ErrorCode;

pub type Result<T> = anyhow::Result<T>;

pub const CHANNEL_ERROR: &str = "channel-error";
pub const CODEC_ERROR: &str = "codec-error";
pub const UNEXPECTED_ERROR: &str = "unexpected-error";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UwbError {
    /// Expected, recoverable failure reported by the host.
    #[error("{code}: {message}")]
    Domain { code: ErrorCode, message: String },

    /// The transport could not deliver the call or its reply.
    #[error("Unable to establish connection on channel: '{channel}'.")]
    Channel { channel: String },

    #[error("Failed to decode message: {0}")]
    Codec(#[from] CodecError),

    /// Unclassified failure, wrapped with the operation it happened in.
    #[error("{operation} failed: {cause}")]
    Unexpected { operation: String, cause: String },

    /// Structured error with a code this side does not know about.
    #[error("{code}: {}", message.as_deref().unwrap_or("no message"))]
    Remote { code: String, message: Option<String>, details: Value },
}

impl UwbError {
    pub fn domain(code: ErrorCode, message: impl Into<String>) -> Self {
        UwbError::Domain { code, message: message.into() }
    }

    pub fn channel(channel: impl Into<String>) -> Self {
        UwbError::Channel { channel: channel.into() }
    }

    pub fn device_not_found(id: &str) -> Self {
        Self::domain(ErrorCode::OobDeviceNotFound, format!("Device {} not found", id))
    }

    /// Domain code, if this is a domain error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            UwbError::Domain { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Keeps domain errors raised by a driver, wraps everything else with
    /// the operation name and the full cause chain.
    pub fn from_driver(operation: &str, err: anyhow::Error) -> Self {
        match err.downcast::<UwbError>() {
            Ok(uwb_err) => uwb_err,
            Err(err) => UwbError::Unexpected {
                operation: operation.to_string(),
                cause: format!("{:#}", err),
            },
        }
    }

    /// Splits the error into its `(code, message, details)` wire triple.
    pub fn to_wire(&self) -> (String, Option<String>, Value) {
        match self {
            UwbError::Domain { code, message } => (
                code.name().to_string(),
                Some(message.clone()),
                Value::Int32(code.raw()),
            ),
            UwbError::Channel { channel } => (
                CHANNEL_ERROR.to_string(),
                Some(self.to_string()),
                Value::String(channel.clone()),
            ),
            UwbError::Codec(err) => {
                (CODEC_ERROR.to_string(), Some(err.to_string()), Value::Null)
            }
            UwbError::Unexpected { operation, cause } => (
                UNEXPECTED_ERROR.to_string(),
                Some(operation.clone()),
                Value::String(cause.clone()),
            ),
            UwbError::Remote { code, message, details } => {
                (code.clone(), message.clone(), details.clone())
            }
        }
    }

    pub fn from_wire(code: String, message: Option<String>, details: Value) -> Self {
        if let Some(error_code) = ErrorCode::from_name(&code) {
            return UwbError::Domain {
                code: error_code,
                message: message.unwrap_or_default(),
            };
        }

        if code == CHANNEL_ERROR {
            if let Value::String(channel) = &details {
                return UwbError::Channel { channel: channel.clone() };
            }
        }

        if code == UNEXPECTED_ERROR {
            if let (Some(operation), Value::String(cause)) = (&message, &details) {
                return UwbError::Unexpected {
                    operation: operation.clone(),
                    cause: cause.clone(),
                };
            }
        }

        UwbError::Remote { code, message, details }
    }
}
