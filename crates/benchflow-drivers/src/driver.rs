/*!
 * Driver declaration surface and resolved instances.
 *
 * A [`DriverFactory`] is the class-level view of a driver: its identity
 * markers, capability tags and default contract. Building it yields a
 * [`Driver`] wrapped around an [`InstrumentCore`], which owns the transport
 * handle together with the live, per-instance contract and the recorded
 * parameter state. [`ResolvedInstance`] is what callers receive; every
 * [`call`](ResolvedInstance::call) is validated against the live contract.
 */
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use benchflow_core::types::{Id, Value};

use crate::contract::{
    CallArgs, CapabilityContract, Constraint, ContractValidator, InstanceState, ValidationReport,
};
use crate::error::{DriverError, Result, TransportError};
use crate::transport::SharedTransport;

/// Default reply timeout used by driver queries
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Abstract instrument category used for type-directed search
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Capability {
    /// Speaks SCPI
    Scpi,
    /// Lock-in amplifier
    Lockin,
    /// Arbitrary waveform generator
    Awg,
    /// Oscilloscope
    Oscilloscope,
    /// Source-measure unit
    SourceMeter,
    /// Digital multimeter
    Dmm,
    /// Pulse generator
    Pulser,
    /// DC voltage calibrator
    DcCalibrator,
    /// Data acquisition board
    Daq,
    /// Stepper motor controller
    StepperMotor,
    /// Anything else
    Custom(String),
}

impl Capability {
    /// Canonical tag
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Scpi => "scpi",
            Capability::Lockin => "lockin",
            Capability::Awg => "awg",
            Capability::Oscilloscope => "oscilloscope",
            Capability::SourceMeter => "sourcemeter",
            Capability::Dmm => "dmm",
            Capability::Pulser => "pulser",
            Capability::DcCalibrator => "dc_calibrator",
            Capability::Daq => "daq",
            Capability::StepperMotor => "stepper_motor",
            Capability::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        let key: String = tag
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match key.as_str() {
            "scpi" => Capability::Scpi,
            "lockin" | "lockinamplifier" => Capability::Lockin,
            "awg" | "arbitrarywaveformgenerator" => Capability::Awg,
            "oscilloscope" | "scope" => Capability::Oscilloscope,
            "sourcemeter" | "smu" => Capability::SourceMeter,
            "dmm" | "multimeter" => Capability::Dmm,
            "pulser" | "pulsegenerator" => Capability::Pulser,
            "dccalibrator" => Capability::DcCalibrator,
            "daq" => Capability::Daq,
            "steppermotor" | "stepper" => Capability::StepperMotor,
            _ => Capability::Custom(tag.trim().to_lowercase()),
        }
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Capability::from(tag.as_str())
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.as_str().to_string()
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Capability::from(s))
    }
}

/// What the scanner learns about one driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    /// Identity fragments that select this driver
    pub identity_markers: BTreeSet<String>,
    /// Fully-qualified path the driver is loaded from
    pub class_path: String,
    /// Capability tags
    pub capability_tags: BTreeSet<String>,
}

/// Class-level declaration of a driver
pub trait DriverFactory: Send + Sync + Debug {
    /// Fully-qualified path of the driver
    fn class_path(&self) -> &str;

    /// Identity fragments; empty means the driver is never auto-selected
    fn identity_markers(&self) -> Vec<String>;

    /// Capabilities the driver provides
    fn capabilities(&self) -> BTreeSet<Capability>;

    /// Class-level default contract, seeded into every instance
    fn contract(&self) -> CapabilityContract;

    /// Wrap an instrument core into a driver
    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>>;

    /// Descriptor for the registry
    fn descriptor(&self) -> DriverDescriptor {
        DriverDescriptor {
            identity_markers: self.identity_markers().into_iter().collect(),
            class_path: self.class_path().to_string(),
            capability_tags: self
                .capabilities()
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
        }
    }

    /// Whether the driver provides `capability`
    fn satisfies(&self, capability: &Capability) -> bool {
        self.capabilities().contains(capability)
    }
}

/// A driver bound to an instrument
#[async_trait]
pub trait Driver: Send + Sync + Debug {
    /// The instrument core
    fn core(&self) -> &InstrumentCore;

    /// Operations this driver implements
    fn operations(&self) -> Vec<&str>;

    /// Execute an operation; arguments are already validated
    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value>;
}

/// Transport, live contract and recorded state of one instrument
#[derive(Debug)]
pub struct InstrumentCore {
    address: String,
    identity: Option<String>,
    transport: SharedTransport,
    contract: RwLock<CapabilityContract>,
    state: RwLock<InstanceState>,
    reply_timeout: Duration,
}

fn poisoned(what: &str) -> DriverError {
    DriverError::other(format!("Failed to acquire lock on instrument {}", what))
}

impl InstrumentCore {
    /// Create a core seeded with a class-level contract
    pub fn new<S: Into<String>>(
        address: S,
        identity: Option<String>,
        transport: SharedTransport,
        contract: CapabilityContract,
    ) -> Self {
        Self {
            address: address.into(),
            identity,
            transport,
            contract: RwLock::new(contract),
            state: RwLock::new(InstanceState::new()),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Override the reply timeout used by [`query`](Self::query)
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Address of the instrument
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Raw identity string, if the device was identified
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Transport handle
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Snapshot of the live contract
    pub fn contract(&self) -> Result<CapabilityContract> {
        self.contract
            .read()
            .map(|c| c.clone())
            .map_err(|_| poisoned("contract"))
    }

    /// Replace the constraint of one parameter on this instance only
    pub fn set_constraint<S: Into<String>>(&self, parameter: S, constraint: Constraint) -> Result<()> {
        let parameter = parameter.into();
        debug!(address = %self.address, %parameter, %constraint, "Instance contract updated");
        self.contract
            .write()
            .map_err(|_| poisoned("contract"))?
            .insert(parameter, constraint);
        Ok(())
    }

    /// Recorded value of a parameter
    pub fn current(&self, parameter: &str) -> Option<Value> {
        self.state.read().ok()?.get(parameter).cloned()
    }

    /// Snapshot of every recorded value
    pub fn current_state(&self) -> Result<InstanceState> {
        self.state
            .read()
            .map(|s| s.clone())
            .map_err(|_| poisoned("state"))
    }

    /// Validate arguments against the live contract and recorded state
    pub fn validate(&self, args: &CallArgs) -> Result<ValidationReport> {
        let contract = self.contract.read().map_err(|_| poisoned("contract"))?;
        let state = self.state.read().map_err(|_| poisoned("state"))?;
        Ok(ContractValidator::validate(&contract, args, &state)?)
    }

    /// Record the constrained arguments of a completed call
    pub fn record(&self, args: &CallArgs) -> Result<()> {
        let contract = self.contract()?;
        let mut state = self.state.write().map_err(|_| poisoned("state"))?;
        ContractValidator::record(&contract, args, &mut state);
        Ok(())
    }

    /// Send a command that has no reply
    pub async fn write(&self, command: &str) -> Result<()> {
        self.transport.send(command).await?;
        Ok(())
    }

    /// Send a command and read its reply
    pub async fn query(&self, command: &str) -> Result<String> {
        self.transport.send(command).await?;
        let reply = self.transport.receive(self.reply_timeout).await?;
        Ok(reply.trim().to_string())
    }
}

/// Fetch a required argument
pub fn required<'a>(args: &'a CallArgs, name: &str) -> Result<&'a Value> {
    args.get(name)
        .ok_or_else(|| DriverError::MissingArgument(name.to_string()))
}

/// Interpret a reply as a number when it parses as one
pub fn reply_value(reply: String) -> Value {
    match reply.trim().parse::<f64>() {
        Ok(n) => Value::Float(n),
        Err(_) => Value::String(reply),
    }
}

/// A driver instantiated on a transport, owned by the caller
#[derive(Debug)]
pub struct ResolvedInstance {
    id: Id,
    class_path: String,
    capabilities: BTreeSet<Capability>,
    driver: Box<dyn Driver>,
}

impl ResolvedInstance {
    /// Instantiate `factory` on `transport`
    pub fn instantiate(
        factory: &Arc<dyn DriverFactory>,
        address: &str,
        identity: Option<String>,
        transport: SharedTransport,
    ) -> Result<Self> {
        let core = InstrumentCore::new(address, identity, transport, factory.contract());
        let driver = factory.build(core)?;
        Ok(Self {
            id: Id::new(),
            class_path: factory.class_path().to_string(),
            capabilities: factory.capabilities(),
            driver,
        })
    }

    /// Instance id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Class path of the driver
    pub fn class_path(&self) -> &str {
        &self.class_path
    }

    /// Address the instance is bound to
    pub fn address(&self) -> &str {
        self.driver.core().address()
    }

    /// Raw identity string
    pub fn identity(&self) -> Option<&str> {
        self.driver.core().identity()
    }

    /// Capabilities of the driver
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Whether the driver provides `capability`
    pub fn satisfies(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Operations the driver implements
    pub fn operations(&self) -> Vec<&str> {
        self.driver.operations()
    }

    /// The instrument core
    pub fn core(&self) -> &InstrumentCore {
        self.driver.core()
    }

    /// Validate `args`, execute `operation`, then record the new state
    pub async fn call(&self, operation: &str, args: CallArgs) -> Result<Value> {
        if !self.driver.operations().contains(&operation) {
            return Err(DriverError::UnsupportedOperation(operation.to_string()));
        }

        let core = self.driver.core();
        let report = core.validate(&args)?;
        if !report.is_clean() {
            debug!(
                address = core.address(),
                operation,
                warnings = report.warnings.len(),
                "Call proceeds with unverified arguments"
            );
        }

        let value = self.driver.execute(operation, &args).await?;
        core.record(&args)?;
        Ok(value)
    }

    /// Close the transport; consuming `self` makes a second release impossible
    pub async fn release(self) -> std::result::Result<(), TransportError> {
        let core = self.driver.core();
        debug!(address = core.address(), class_path = %self.class_path, "Releasing instance");
        let result = core.transport().close().await;
        if let Err(e) = &result {
            warn!(address = core.address(), error = %e, "Failed to close transport");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedConnector, SimulatedDevice};
    use crate::transport::Connector;

    #[derive(Debug)]
    struct Attenuator {
        core: InstrumentCore,
    }

    #[async_trait]
    impl Driver for Attenuator {
        fn core(&self) -> &InstrumentCore {
            &self.core
        }

        fn operations(&self) -> Vec<&str> {
            vec!["set_level", "set_mode"]
        }

        async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
            match operation {
                "set_level" => {
                    let level = required(args, "level")?;
                    self.core.write(&format!("LEV {}", level)).await?;
                }
                _ => {
                    // High mode widens the level window
                    if required(args, "mode")?.normalized() == "high" {
                        self.core.set_constraint("level", Constraint::range(0.0, 100.0))?;
                    }
                }
            }
            Ok(Value::Null)
        }
    }

    #[derive(Debug)]
    struct AttenuatorFactory;

    impl DriverFactory for AttenuatorFactory {
        fn class_path(&self) -> &str {
            "tests::Attenuator"
        }

        fn identity_markers(&self) -> Vec<String> {
            vec!["ATT-1".into(), "ATT1".into()]
        }

        fn capabilities(&self) -> BTreeSet<Capability> {
            [Capability::Custom("attenuator".into())].into_iter().collect()
        }

        fn contract(&self) -> CapabilityContract {
            CapabilityContract::new()
                .with("level", Constraint::range(0.0, 10.0))
                .with("mode", Constraint::one_of(["low", "high"]))
        }

        fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
            Ok(Box::new(Attenuator { core }))
        }
    }

    async fn instance(connector: &SimulatedConnector) -> ResolvedInstance {
        let transport = connector.open("ATT").await.unwrap();
        let factory: Arc<dyn DriverFactory> = Arc::new(AttenuatorFactory);
        ResolvedInstance::instantiate(&factory, "ATT", Some("ATT-1".into()), transport).unwrap()
    }

    #[test]
    fn test_capability_parsing() {
        assert_eq!(Capability::from("Lock-In"), Capability::Lockin);
        assert_eq!("SMU".parse::<Capability>().unwrap(), Capability::SourceMeter);
        assert_eq!(Capability::from("laser"), Capability::Custom("laser".into()));
        assert_eq!(Capability::DcCalibrator.to_string(), "dc_calibrator");
        assert_eq!(Capability::from(Capability::StepperMotor.to_string()), Capability::StepperMotor);
    }

    #[test]
    fn test_descriptor() {
        let descriptor = AttenuatorFactory.descriptor();
        assert_eq!(descriptor.class_path, "tests::Attenuator");
        assert!(descriptor.identity_markers.contains("ATT1"));
        assert!(descriptor.capability_tags.contains("attenuator"));
    }

    #[tokio::test]
    async fn test_call_validates_and_records() {
        let connector = SimulatedConnector::new().with_device("ATT", SimulatedDevice::stream());
        let att = instance(&connector).await;

        att.call("set_level", CallArgs::new().with("level", 10.0)).await.unwrap();
        assert_eq!(att.core().current("level"), Some(Value::Float(10.0)));

        let err = att.call("set_level", CallArgs::new().with("level", 10.5)).await.unwrap_err();
        assert!(matches!(err, DriverError::Contract(_)));
        assert_eq!(connector.sent("ATT"), vec!["LEV 10"]);
        assert_eq!(att.core().current("level"), Some(Value::Float(10.0)));

        assert!(matches!(
            att.call("explode", CallArgs::new()).await,
            Err(DriverError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_live_contract_mutation_is_per_instance() {
        let connector = SimulatedConnector::new().with_device("ATT", SimulatedDevice::stream());
        let first = instance(&connector).await;
        let second = instance(&connector).await;

        first.call("set_mode", CallArgs::new().with("mode", "HIGH")).await.unwrap();
        first.call("set_level", CallArgs::new().with("level", 50)).await.unwrap();
        assert!(second.call("set_level", CallArgs::new().with("level", 50)).await.is_err());
        assert_eq!(AttenuatorFactory.contract().get("level"), Some(&Constraint::range(0.0, 10.0)));
    }

    #[tokio::test]
    async fn test_release_closes_once() {
        let connector = SimulatedConnector::new().with_device("ATT", SimulatedDevice::stream());
        let att = instance(&connector).await;
        att.release().await.unwrap();
        assert_eq!(connector.closes("ATT"), 1);
    }

    #[test]
    fn test_reply_value() {
        assert_eq!(reply_value("1.25E-3".into()), Value::Float(1.25e-3));
        assert_eq!(reply_value("OK".into()), Value::String("OK".into()));
    }
}
