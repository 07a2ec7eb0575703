/*!
 * Simulated connector.
 *
 * Serves scripted query/response tables for stream devices and a list of
 * enumerable bus devices, so that resolution can run without hardware.
 * Bus devices accept writes but have no reply channel.
 * Every open, close and sent command is counted for inspection.
 */
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::transport::{
    Connector, LocalDevice, ResourceAddress, SharedTransport, Transport, TransportKind,
};

/// Default name of the simulated connector
pub const SIMULATED_CONNECTOR: &str = "sim";

/// Scripted behaviour of one simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    /// Link kind
    #[serde(default = "default_kind")]
    pub kind: TransportKind,
    /// Reply per command, matched after trimming
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
    /// Whether every command is echoed back before the reply
    #[serde(default)]
    pub echo: bool,
    /// Whether replies never arrive and receives block
    #[serde(default)]
    pub hang: bool,
    /// Whether opening the address fails
    #[serde(default)]
    pub unreachable: bool,
    /// Bus identity, for bus devices
    #[serde(default)]
    pub local: Option<LocalDevice>,
    /// Physical device id for deduplication
    #[serde(default)]
    pub physical_id: Option<String>,
}

fn default_kind() -> TransportKind {
    TransportKind::Stream
}

impl SimulatedDevice {
    /// A stream device with no scripted replies
    pub fn stream() -> Self {
        Self {
            kind: TransportKind::Stream,
            responses: BTreeMap::new(),
            echo: false,
            hang: false,
            unreachable: false,
            local: None,
            physical_id: None,
        }
    }

    /// A bus device enumerated as `product_name` with `unique_id`
    pub fn bus<P: Into<String>, U: Into<String>>(product_name: P, unique_id: U) -> Self {
        Self {
            kind: TransportKind::Bus,
            local: Some(LocalDevice::new(product_name, unique_id)),
            ..Self::stream()
        }
    }

    /// Script a reply to a command
    pub fn respond<C: Into<String>, R: Into<String>>(mut self, command: C, reply: R) -> Self {
        self.responses.insert(command.into(), reply.into());
        self
    }

    /// Echo every command before replying
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Never reply
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Fail to open
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Set the physical device id
    pub fn with_physical_id<S: Into<String>>(mut self, id: S) -> Self {
        self.physical_id = Some(id.into());
        self
    }
}

/// Activity recorded for one address
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceActivity {
    /// Number of successful opens
    pub opens: usize,
    /// Number of close calls
    pub closes: usize,
    /// Commands sent, in order
    pub sent: Vec<String>,
}

type ActivityLog = Arc<Mutex<BTreeMap<String, DeviceActivity>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connector serving [`SimulatedDevice`]s
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    name: String,
    devices: Arc<Mutex<BTreeMap<String, SimulatedDevice>>>,
    activity: ActivityLog,
}

impl SimulatedConnector {
    /// Create an empty connector named [`SIMULATED_CONNECTOR`]
    pub fn new() -> Self {
        Self::named(SIMULATED_CONNECTOR)
    }

    /// Create an empty connector with a custom name
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            devices: Arc::new(Mutex::new(BTreeMap::new())),
            activity: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Attach a device at `address`
    pub fn add_device<S: Into<String>>(&self, address: S, device: SimulatedDevice) {
        lock(&self.devices).insert(address.into(), device);
    }

    /// Builder-style [`add_device`](Self::add_device)
    pub fn with_device<S: Into<String>>(self, address: S, device: SimulatedDevice) -> Self {
        self.add_device(address, device);
        self
    }

    /// Activity recorded for `address`
    pub fn activity(&self, address: &str) -> DeviceActivity {
        lock(&self.activity).get(address).cloned().unwrap_or_default()
    }

    /// Number of successful opens of `address`
    pub fn opens(&self, address: &str) -> usize {
        self.activity(address).opens
    }

    /// Number of close calls on `address`
    pub fn closes(&self, address: &str) -> usize {
        self.activity(address).closes
    }

    /// Commands sent to `address`
    pub fn sent(&self, address: &str) -> Vec<String> {
        self.activity(address).sent
    }

    fn local_devices(&self) -> Vec<LocalDevice> {
        lock(&self.devices)
            .values()
            .filter_map(|d| d.local.clone())
            .collect()
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, address: &str) -> bool {
        lock(&self.devices).contains_key(address)
    }

    async fn list_resources(&self) -> Result<Vec<ResourceAddress>, TransportError> {
        let devices = lock(&self.devices);
        Ok(devices
            .iter()
            .map(|(address, device)| {
                let resource = ResourceAddress::new(address.clone(), self.name.clone());
                match &device.physical_id {
                    Some(id) => resource.with_physical_id(id.clone()),
                    None => resource,
                }
            })
            .collect())
    }

    async fn open(&self, address: &str) -> Result<SharedTransport, TransportError> {
        let device = lock(&self.devices)
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("no simulated device at {}", address)))?;

        if device.unreachable {
            return Err(TransportError::Unreachable(format!(
                "simulated device at {} does not answer",
                address
            )));
        }

        lock(&self.activity).entry(address.to_string()).or_default().opens += 1;
        debug!(address, kind = ?device.kind, "Opened simulated transport");

        Ok(Arc::new(SimulatedTransport {
            address: address.to_string(),
            local_devices: self.local_devices(),
            device,
            pending: Mutex::new(VecDeque::new()),
            closed: Mutex::new(false),
            activity: self.activity.clone(),
        }))
    }
}

/// Transport handle onto a [`SimulatedDevice`]
#[derive(Debug)]
pub struct SimulatedTransport {
    address: String,
    device: SimulatedDevice,
    local_devices: Vec<LocalDevice>,
    pending: Mutex<VecDeque<String>>,
    closed: Mutex<bool>,
    activity: ActivityLog,
}

impl SimulatedTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if *lock(&self.closed) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn kind(&self) -> TransportKind {
        self.device.kind
    }

    async fn send(&self, command: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        trace!(address = %self.address, command, "Simulated send");
        lock(&self.activity)
            .entry(self.address.clone())
            .or_default()
            .sent
            .push(command.to_string());

        if self.device.hang {
            return Ok(());
        }

        let mut pending = lock(&self.pending);
        if self.device.echo {
            pending.push_back(command.to_string());
        }
        if let Some(reply) = self.device.responses.get(command.trim()) {
            pending.push_back(reply.clone());
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<String, TransportError> {
        self.ensure_open()?;
        if self.device.kind == TransportKind::Bus {
            return Err(TransportError::Unsupported(format!(
                "{} has no query channel",
                self.address
            )));
        }
        if self.device.hang {
            // Hangs past any caller deadline
            futures::future::pending::<()>().await;
        }
        lock(&self.pending)
            .pop_front()
            .ok_or(TransportError::Timeout(timeout))
    }

    async fn list_local_devices(&self) -> Result<Vec<LocalDevice>, TransportError> {
        self.ensure_open()?;
        match self.device.kind {
            TransportKind::Bus => Ok(self.local_devices.clone()),
            TransportKind::Stream => Err(TransportError::Unsupported(format!(
                "{} is not an enumerable bus",
                self.address
            ))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        *lock(&self.closed) = true;
        lock(&self.activity).entry(self.address.clone()).or_default().closes += 1;
        debug!(address = %self.address, "Closed simulated transport");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_reply_and_echo() {
        let connector = SimulatedConnector::new().with_device(
            "GPIB0::8::INSTR",
            SimulatedDevice::stream()
                .respond("*IDN?", "Stanford_Research_Systems,SR830,s/n1,ver1.07")
                .with_echo(),
        );

        let transport = connector.open("GPIB0::8::INSTR").await.unwrap();
        transport.send("*IDN?").await.unwrap();
        let timeout = Duration::from_millis(10);
        assert_eq!(transport.receive(timeout).await.unwrap(), "*IDN?");
        assert!(transport.receive(timeout).await.unwrap().contains("SR830"));
        assert!(transport.receive(timeout).await.unwrap_err().is_timeout());

        assert_eq!(connector.sent("GPIB0::8::INSTR"), vec!["*IDN?"]);
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable() {
        let connector =
            SimulatedConnector::new().with_device("ASRL3::INSTR", SimulatedDevice::stream().unreachable());
        assert!(connector.handles("ASRL3::INSTR"));
        assert!(!connector.handles("ASRL4::INSTR"));
        assert!(matches!(
            connector.open("ASRL3::INSTR").await.unwrap_err(),
            TransportError::Unreachable(_)
        ));
        assert_eq!(connector.opens("ASRL3::INSTR"), 0);
    }

    #[tokio::test]
    async fn test_close_counts_and_blocks_io() {
        let connector = SimulatedConnector::new().with_device("TCPIP::1", SimulatedDevice::stream());
        let transport = connector.open("TCPIP::1").await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.send("*RST").await.unwrap_err(), TransportError::Closed);
        assert_eq!(connector.opens("TCPIP::1"), 1);
        assert_eq!(connector.closes("TCPIP::1"), 1);
    }

    #[tokio::test]
    async fn test_bus_devices_enumerate() {
        let connector = SimulatedConnector::new()
            .with_device("USB::01D3F5A2", SimulatedDevice::bus("USB-231", "01D3F5A2"))
            .with_device("GPIB0::1::INSTR", SimulatedDevice::stream().with_physical_id("dmm"));

        let resources = connector.list_resources().await.unwrap();
        assert_eq!(resources.len(), 2);

        let bus = connector.open("USB::01D3F5A2").await.unwrap();
        assert_eq!(bus.kind(), TransportKind::Bus);
        assert!(!bus.supports_generic_driver());
        let local = bus.list_local_devices().await.unwrap();
        assert_eq!(local, vec![LocalDevice::new("USB-231", "01D3F5A2")]);
        bus.send("AOUT 0 1.5").await.unwrap();
        assert!(matches!(
            bus.receive(Duration::from_millis(5)).await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
