//! Error types for charge point control
//!
//! Every fallible operation in this crate returns [`ChargerResult`]. The
//! variants follow the failure classes a supervising energy manager has to
//! tell apart: an unreachable unit, a rejected command, a status code the
//! driver does not know, and a facet that was never composed in.

use thiserror::Error;

use crate::capability::Capability;

/// Result type used throughout the crate.
pub type ChargerResult<T> = Result<T, ChargerError>;

/// Charge point error taxonomy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChargerError {
    /// Transport unreachable, connection reset or request rejected by the link.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// A transport call exceeded its deadline.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Caller supplied a value the unit must never receive.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Hardware reported a status code outside the documented table.
    #[error("Unknown status code: {code} ({context})")]
    UnknownStatus { code: u32, context: String },

    /// A facet was invoked that this unit was not composed with.
    #[error("Capability unavailable: {capability}")]
    CapabilityUnavailable { capability: Capability },

    /// Credential or challenge failure on an authenticated transport.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Payload could not be decoded.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// The unit is in a transition that does not accept the command yet.
    #[error("Busy: {message}")]
    Busy { message: String },

    /// Bad configuration or unknown driver type.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ChargerError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unknown_status<S: Into<String>>(code: u32, context: S) -> Self {
        Self::UnknownStatus {
            code,
            context: context.into(),
        }
    }

    pub fn unavailable(capability: Capability) -> Self {
        Self::CapabilityUnavailable { capability }
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn busy<S: Into<String>>(message: S) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Errors raised by the link rather than by the unit's answer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::AuthenticationFailed { .. }
        )
    }

    /// Whether repeating the same call later may succeed.
    ///
    /// The core never retries on its own; this is a hint for the caller's
    /// supervision loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Busy { .. }
        )
    }
}

impl From<serde_json::Error> for ChargerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(err.to_string())
    }
}
