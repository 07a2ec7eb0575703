/*!
 * BenchFlow Drivers
 *
 * This crate turns connection addresses, or requested capabilities, into
 * driver instances whose every call is checked against the parameter
 * envelope the driver declares.
 *
 * The pieces, leaves first:
 *
 * - [`contract`]: constraints, contracts and the validator
 * - [`transport`]: the connector/transport boundary
 * - [`probe`]: identity probing over one transport handle
 * - [`registry`]: the persistent identity-fragment cache
 * - [`sources`] and [`scanner`]: on-demand driver discovery
 * - [`resolver`]: the resolution state machine
 * - [`enumerator`]: address enumeration for type-directed search
 */

#![warn(missing_docs)]

// Re-export core types
pub use benchflow_core::prelude;

pub mod catalog;
pub mod contract;
pub mod driver;
pub mod enumerator;
pub mod error;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod simulated;
pub mod sources;
pub mod transport;

pub use contract::{
    CallArgs, CapabilityContract, Constraint, ContractValidator, ContractViolation, ValidationReport,
    ValidationWarning,
};
pub use driver::{Capability, Driver, DriverDescriptor, DriverFactory, InstrumentCore, ResolvedInstance};
pub use enumerator::ResourceEnumerator;
pub use error::{DriverError, ResolveError, TransportError};
pub use probe::{IdentityProbe, ProbeProfile, ProbeResult};
pub use registry::{DriverRegistry, SharedDriverRegistry};
pub use resolver::{NotFoundReason, Resolution, ResolveOptions, ResolveState, Resolver, Target};
pub use scanner::{DriverScanner, ScanReport};
pub use transport::{Connector, ConnectorHub, ResourceAddress, SharedTransport, Transport, TransportKind};

/// BenchFlow drivers crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the driver system
pub fn init() -> Result<(), benchflow_core::error::Error> {
    tracing::info!("BenchFlow Drivers {} initialized", VERSION);
    Ok(())
}

/// Names of the built-in drivers' class paths
pub fn builtin_drivers() -> Vec<&'static str> {
    vec![
        catalog::GenericScpiFactory::CLASS_PATH,
        catalog::Sr830Factory::CLASS_PATH,
        catalog::Agilent81150aFactory::CLASS_PATH,
        catalog::Keithley2400Factory::CLASS_PATH,
        catalog::Keithley193aFactory::CLASS_PATH,
        catalog::Usb231Factory::CLASS_PATH,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_class_paths() {
        let drivers = builtin_drivers();
        assert!(drivers.iter().all(|path| path.starts_with("benchflow_drivers::catalog::")));
        assert!(drivers.contains(&"benchflow_drivers::catalog::lockin::Sr830"));
    }
}
