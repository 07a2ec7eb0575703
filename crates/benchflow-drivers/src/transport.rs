/*!
 * Transport boundary.
 *
 * The crate never opens links itself. A [`Connector`] knows how to reach a
 * family of addresses and hands out [`Transport`] handles; the probe and the
 * drivers only ever talk through those handles.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;

/// Kind of link behind a transport handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Byte-stream query/response link (GPIB, serial, TCP)
    Stream,
    /// Locally enumerable bus without a query channel (USB DAQ)
    Bus,
}

/// A device visible on a local bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDevice {
    /// Product name reported by the bus
    pub product_name: String,
    /// Unique id of the device on the bus
    pub unique_id: String,
}

impl LocalDevice {
    /// Create a new local device record
    pub fn new<P: Into<String>, U: Into<String>>(product_name: P, unique_id: U) -> Self {
        Self {
            product_name: product_name.into(),
            unique_id: unique_id.into(),
        }
    }

    /// Whether this device is the one an address refers to
    pub fn matches_address(&self, address: &str) -> bool {
        address.eq_ignore_ascii_case(&self.unique_id)
            || address
                .split("::")
                .any(|part| part.eq_ignore_ascii_case(&self.unique_id))
    }
}

/// An open link to one device
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Address this handle was opened on
    fn address(&self) -> &str;

    /// Kind of link
    fn kind(&self) -> TransportKind;

    /// Send a command
    async fn send(&self, command: &str) -> Result<(), TransportError>;

    /// Receive one reply, waiting at most `timeout`
    async fn receive(&self, timeout: Duration) -> Result<String, TransportError>;

    /// Devices visible on the local bus
    async fn list_local_devices(&self) -> Result<Vec<LocalDevice>, TransportError> {
        Err(TransportError::Unsupported(format!(
            "{} cannot enumerate local devices",
            self.address()
        )))
    }

    /// Whether a generic capability-less driver can operate this link
    fn supports_generic_driver(&self) -> bool {
        self.kind() == TransportKind::Stream
    }

    /// Release the link
    async fn close(&self) -> Result<(), TransportError>;
}

/// A shared transport handle
pub type SharedTransport = Arc<dyn Transport>;

/// A reachable address as reported by a connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAddress {
    /// Connection address
    pub address: String,
    /// Name of the connector that reported it
    pub connector: String,
    /// Identifier of the physical device, when the connector knows it
    pub physical_id: Option<String>,
}

impl ResourceAddress {
    /// Create a new resource address
    pub fn new<A: Into<String>, C: Into<String>>(address: A, connector: C) -> Self {
        Self {
            address: address.into(),
            connector: connector.into(),
            physical_id: None,
        }
    }

    /// Attach the physical device id
    pub fn with_physical_id<S: Into<String>>(mut self, id: S) -> Self {
        self.physical_id = Some(id.into());
        self
    }
}

/// Opens transports for a family of addresses
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Connector name, also the name of its probe profile
    fn name(&self) -> &str;

    /// Whether this connector can open `address`
    fn handles(&self, address: &str) -> bool;

    /// Reachable addresses
    async fn list_resources(&self) -> Result<Vec<ResourceAddress>, TransportError>;

    /// Open a transport on `address`
    async fn open(&self, address: &str) -> Result<SharedTransport, TransportError>;
}

/// The set of connectors available to the resolver
#[derive(Debug, Clone, Default)]
pub struct ConnectorHub {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector
    pub fn register<C: Connector + 'static>(&mut self, connector: C) {
        self.connectors.push(Arc::new(connector));
    }

    /// Register an already shared connector
    pub fn register_shared(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.push(connector);
    }

    /// Builder-style registration
    pub fn with<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.register(connector);
        self
    }

    /// Registered connectors, in registration order
    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    /// First connector that handles `address`
    pub fn connector_for(&self, address: &str) -> Option<Arc<dyn Connector>> {
        let found = self.connectors.iter().find(|c| c.handles(address)).cloned();
        if let Some(connector) = &found {
            debug!(address, connector = connector.name(), "Selected connector");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_device_address_match() {
        let device = LocalDevice::new("USB-231", "01D3F5A2");
        assert!(device.matches_address("01d3f5a2"));
        assert!(device.matches_address("USB::01D3F5A2::DAQ"));
        assert!(!device.matches_address("USB::01D3F5A3"));
    }

    #[test]
    fn test_resource_address_builder() {
        let addr = ResourceAddress::new("GPIB0::8::INSTR", "gpib").with_physical_id("sr830-1");
        assert_eq!(addr.connector, "gpib");
        assert_eq!(addr.physical_id.as_deref(), Some("sr830-1"));
    }
}
