/*!
 * Prelude module for BenchFlow Core.
 *
 * This module re-exports commonly used types and functions from the BenchFlow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Value};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{duration_to_millis, is_close, millis_to_duration, with_timeout, within};

// Re-export logging helpers
pub use crate::logging::{component_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
