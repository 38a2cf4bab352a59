//! Unified error types for the presence core library.
//!
//! Each module owns a specific error enum ([`ConfigError`], [`BluetoothError`],
//! [`PingError`], [`ChannelError`], [`HttpError`], [`MotionError`]). They all
//! convert into [`PresenceError`], which classifies a failure by how the
//! reactor reacts to it:
//!
//! - **Transport unavailable**: the transport is disabled, the rest keep running.
//! - **Resolution failure**: one target is dropped, the rest of its probe runs.
//! - **Configuration / invalid root**: fatal before the reactor starts.
//!
//! Transient check failures never reach this type; they are inconclusive
//! readings handled inside the probe.
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`BluetoothError`]: crate::bluetooth::BluetoothError
//! [`PingError`]: crate::ping::PingError
//! [`ChannelError`]: crate::pipe::ChannelError
//! [`HttpError`]: crate::http::HttpError
//! [`MotionError`]: crate::motion::MotionError

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Transport;

/// The unified error type for all presence operations.
#[derive(Debug, Error)]
pub enum PresenceError {
    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// A transport could not be initialized and is disabled.
    #[error("{transport} transport unavailable: {reason}")]
    TransportUnavailable {
        /// The affected transport.
        transport: Transport,
        /// Why it could not start.
        reason: String,
    },

    /// A configured target could not be resolved and is skipped.
    #[error("cannot resolve '{target}': {reason}")]
    ResolutionFailed {
        /// Host name or address as configured.
        target: String,
        /// Resolver message.
        reason: String,
    },

    /// A single request or read failed; the transport stays up.
    #[error("{transport} request failed: {reason}")]
    RequestFailed {
        /// The affected transport.
        transport: Transport,
        /// What went wrong.
        reason: String,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The root working directory does not exist or cannot be entered.
    #[error("invalid root directory: {}", .0.display())]
    InvalidRoot(PathBuf),

    /// A configuration source could not be read or parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for presence operations.
pub type Result<T> = std::result::Result<T, PresenceError>;

impl PresenceError {
    /// Returns `true` if a transport has to be disabled.
    #[inline]
    #[must_use]
    pub const fn is_transport_unavailable(&self) -> bool {
        matches!(self, Self::TransportUnavailable { .. })
    }

    /// Returns `true` if one target could not be resolved.
    #[inline]
    #[must_use]
    pub const fn is_resolution_error(&self) -> bool {
        matches!(self, Self::ResolutionFailed { .. })
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRoot(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if the process cannot continue.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.is_config_error()
    }

    /// The transport this error belongs to, if any.
    #[must_use]
    pub const fn transport(&self) -> Option<Transport> {
        match self {
            Self::TransportUnavailable { transport, .. } | Self::RequestFailed { transport, .. } => {
                Some(*transport)
            }
            Self::ResolutionFailed { .. } => Some(Transport::Ping),
            _ => None,
        }
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::TransportUnavailable { .. } => "TRANSPORT_UNAVAILABLE",
            Self::ResolutionFailed { .. } => "RESOLUTION_FAILED",
            Self::RequestFailed { .. } => "REQUEST_FAILED",
            Self::InvalidRoot(_) => "INVALID_ROOT",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }

    fn unavailable(transport: Transport, reason: impl ToString) -> Self {
        Self::TransportUnavailable {
            transport,
            reason: reason.to_string(),
        }
    }

    fn request(transport: Transport, reason: impl ToString) -> Self {
        Self::RequestFailed {
            transport,
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for PresenceError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::ReadError { path, source } => {
                Self::ConfigParseError(format!("Failed to read {path}: {source}"))
            }
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            err @ (ConfigError::ValidationError { .. }
            | ConfigError::MultipleValidationErrors(_)) => {
                Self::ConfigValidationError(err.to_string())
            }
        }
    }
}

impl From<crate::bluetooth::BluetoothError> for PresenceError {
    fn from(err: crate::bluetooth::BluetoothError) -> Self {
        Self::unavailable(Transport::Bluetooth, err)
    }
}

impl From<crate::ping::PingError> for PresenceError {
    fn from(err: crate::ping::PingError) -> Self {
        use crate::ping::PingError;
        match err {
            PingError::Unresolvable { target, source } => Self::ResolutionFailed {
                target,
                reason: source.to_string(),
            },
            other @ (PingError::RawSocket(_) | PingError::Spawn { .. }) => {
                Self::unavailable(Transport::Ping, other)
            }
        }
    }
}

impl From<crate::pipe::ChannelError> for PresenceError {
    fn from(err: crate::pipe::ChannelError) -> Self {
        use crate::pipe::ChannelError;
        match err {
            ChannelError::Read(_) => Self::request(Transport::Pipe, err),
            other => Self::unavailable(Transport::Pipe, other),
        }
    }
}

impl From<crate::http::HttpError> for PresenceError {
    fn from(err: crate::http::HttpError) -> Self {
        use crate::http::HttpError;
        match err {
            HttpError::Bind { .. } => Self::unavailable(Transport::Http, err),
            other => Self::request(Transport::Http, other),
        }
    }
}

impl From<crate::motion::MotionError> for PresenceError {
    fn from(err: crate::motion::MotionError) -> Self {
        Self::unavailable(Transport::Motion, err)
    }
}

// =============================================================================
// TESTS
// =============================================================================
