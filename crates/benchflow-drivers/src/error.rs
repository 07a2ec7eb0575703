/*!
 * Error types shared across the driver crate.
 *
 * Contract violations live in [`crate::contract`], registry and source
 * errors next to the code that recovers from them.
 */
use std::time::Duration;

use thiserror::Error;

use crate::contract::ContractViolation;

/// Failure reported by a transport handle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No reply arrived within the allotted time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The device could not be reached at all
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Communication failed mid-exchange
    #[error("I/O failure: {0}")]
    Io(String),

    /// The handle was already closed
    #[error("Transport closed")]
    Closed,

    /// The transport kind does not support the operation
    #[error("Unsupported by transport: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether this is a plain reply timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Error raised by a resolved driver while executing an operation
#[derive(Error, Debug)]
pub enum DriverError {
    /// Arguments fell outside the live contract
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// Transport failure during the operation
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The driver does not implement the operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A required argument was not supplied
    #[error("Missing argument: {0}")]
    MissingArgument(String),

    /// A command template could not be rendered
    #[error("Command format error: {0}")]
    Format(String),

    /// Other error
    #[error("Driver error: {0}")]
    Other(String),
}

impl DriverError {
    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DriverError::Other(msg.as_ref().to_string())
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Error terminating a resolution
///
/// "No driver found" and "device present but unidentified" are not errors;
/// they are reported through [`crate::resolver::Resolution::NotFound`].
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The device could not be reached or communication failed
    #[error("Transport failure at {address}: {source}")]
    Transport {
        /// Address being resolved
        address: String,
        /// Underlying transport error
        source: TransportError,
    },

    /// No connector handles the address
    #[error("No connector handles address {0}")]
    UnsupportedAddress(String),

    /// The matched driver could not be instantiated
    #[error("Failed to instantiate {class_path}: {source}")]
    Instantiation {
        /// Driver class path
        class_path: String,
        /// Underlying driver error
        source: DriverError,
    },
}

impl ResolveError {
    /// Wrap a transport error with the address it occurred on
    pub fn transport<S: AsRef<str>>(address: S, source: TransportError) -> Self {
        ResolveError::Transport {
            address: address.as_ref().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Timeout(Duration::from_millis(200));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Timed out after 200ms");
        assert!(!TransportError::Closed.is_timeout());
    }

    #[test]
    fn test_resolve_error_wraps_address() {
        let err = ResolveError::transport("GPIB0::8::INSTR", TransportError::Unreachable("no listener".into()));
        assert_eq!(
            err.to_string(),
            "Transport failure at GPIB0::8::INSTR: Unreachable: no listener"
        );
    }
}
