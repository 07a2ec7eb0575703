/*!
 * Lock-in amplifiers.
 *
 * [`lockin_contract`] holds the envelope shared by the family; the SR830
 * driver overlays it with its own ranges and setting tables. Settings that
 * the instrument selects by index (sensitivity, time constant, slope) are
 * declared as enumerations of physical values and translated on the way out.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use benchflow_core::types::Value;

use crate::catalog::position;
use crate::contract::{CallArgs, CapabilityContract, Constraint};
use crate::driver::{reply_value, required, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::{DriverError, Result};

/// Sensitivities in volts, indexed as the `SENS` command expects
pub const VOLTAGE_SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 1e-8, 2e-8, 5e-8, 1e-7, 2e-7, 5e-7, 1e-6, 2e-6, 5e-6, 1e-5, 2e-5, 5e-5, 1e-4,
    2e-4, 5e-4, 1e-3, 2e-3, 5e-3, 1e-2, 2e-2, 5e-2, 0.1, 0.2, 0.5, 1.0,
];

/// Sensitivities in amperes for the current inputs
pub const CURRENT_SENSITIVITIES: [f64; 27] = [
    2e-15, 5e-15, 1e-14, 2e-14, 5e-14, 1e-13, 2e-13, 5e-13, 1e-12, 2e-12, 5e-12, 1e-11, 2e-11,
    5e-11, 1e-10, 2e-10, 5e-10, 1e-9, 2e-9, 5e-9, 1e-8, 2e-8, 5e-8, 1e-7, 2e-7, 5e-7, 1e-6,
];

/// Time constants in seconds, indexed as `OFLT` expects
pub const TIME_CONSTANTS: [f64; 20] = [
    10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0,
    30.0, 100.0, 300.0, 1e3, 3e3, 10e3, 30e3,
];

/// Low-pass filter slopes in dB/octave
pub const FILTER_SLOPES: [f64; 4] = [6.0, 12.0, 18.0, 24.0];

const REFERENCE_SOURCES: [&str; 2] = ["external", "internal"];
const INPUT_CONFIGURATIONS: [&str; 4] = ["A", "A-B", "I (1M)", "I (100M)"];
const INPUT_COUPLINGS: [&str; 2] = ["AC", "DC"];
const INPUT_SHIELDS: [&str; 2] = ["Float", "Ground"];
const NOTCH_FILTERS: [&str; 4] = ["Out", "Line In", "2x Line In", "Both In"];

/// Order in which `configure` applies settings
const SETTINGS: [&str; 12] = [
    "reference_source",
    "frequency",
    "harmonic",
    "phase",
    "sine_voltage",
    "input_configuration",
    "input_shield",
    "input_coupling",
    "notch_filter",
    "sensitivity",
    "time_constant",
    "filter_slope",
];

/// Envelope shared by every lock-in amplifier
pub fn lockin_contract() -> CapabilityContract {
    CapabilityContract::new()
        .with("input_coupling", Constraint::one_of(INPUT_COUPLINGS))
        .with("phase", Constraint::range(-180.0, 180.0))
        .with("harmonic", Constraint::at_least(1.0))
}

/// Stanford Research Systems SR830
#[derive(Debug)]
pub struct Sr830 {
    core: InstrumentCore,
}

impl Sr830 {
    fn table_index<T>(table: &[T], parameter: &str, value: &Value) -> Result<usize>
    where
        T: Into<Value> + Copy,
    {
        position(table, value)
            .ok_or_else(|| DriverError::other(format!("{} has no setting {}", parameter, value)))
    }

    fn sensitivity_table(&self, args: &CallArgs) -> &'static [f64; 27] {
        let configuration = args
            .get("input_configuration")
            .cloned()
            .or_else(|| self.core.current("input_configuration"))
            .map(|v| v.normalized())
            .unwrap_or_default();
        if configuration.starts_with('i') {
            &CURRENT_SENSITIVITIES
        } else {
            &VOLTAGE_SENSITIVITIES
        }
    }

    fn command_for(&self, parameter: &str, value: &Value, args: &CallArgs) -> Result<String> {
        let command = match parameter {
            "reference_source" => format!("FMOD {}", Self::table_index(&REFERENCE_SOURCES, parameter, value)?),
            "frequency" => format!("FREQ {}", value),
            "harmonic" => format!("HARM {}", value),
            "phase" => format!("PHAS {}", value),
            "sine_voltage" => format!("SLVL {}", value),
            "input_configuration" => {
                format!("ISRC {}", Self::table_index(&INPUT_CONFIGURATIONS, parameter, value)?)
            }
            "input_shield" => format!("IGND {}", Self::table_index(&INPUT_SHIELDS, parameter, value)?),
            "input_coupling" => format!("ICPL {}", Self::table_index(&INPUT_COUPLINGS, parameter, value)?),
            "notch_filter" => format!("ILIN {}", Self::table_index(&NOTCH_FILTERS, parameter, value)?),
            "sensitivity" => format!(
                "SENS {}",
                Self::table_index(self.sensitivity_table(args), parameter, value)?
            ),
            "time_constant" => format!("OFLT {}", Self::table_index(&TIME_CONSTANTS, parameter, value)?),
            "filter_slope" => format!("OFSL {}", Self::table_index(&FILTER_SLOPES, parameter, value)?),
            other => return Err(DriverError::UnsupportedOperation(format!("set_{}", other))),
        };
        Ok(command)
    }

    async fn read_output(&self, index: u8) -> Result<Value> {
        Ok(reply_value(self.core.query(&format!("OUTP? {}", index)).await?))
    }
}

#[async_trait]
impl Driver for Sr830 {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        vec![
            "configure",
            "set_reference_source",
            "set_frequency",
            "set_harmonic",
            "set_phase",
            "set_sine_voltage",
            "set_input_configuration",
            "set_input_shield",
            "set_input_coupling",
            "set_notch_filter",
            "set_sensitivity",
            "set_time_constant",
            "set_filter_slope",
            "get_frequency",
            "get_x",
            "get_y",
            "get_r",
            "get_theta",
        ]
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        match operation {
            "configure" => {
                for parameter in SETTINGS {
                    if let Some(value) = args.get(parameter) {
                        let command = self.command_for(parameter, value, args)?;
                        self.core.write(&command).await?;
                    }
                }
                Ok(Value::Null)
            }
            "get_frequency" => Ok(reply_value(self.core.query("FREQ?").await?)),
            "get_x" => self.read_output(1).await,
            "get_y" => self.read_output(2).await,
            "get_r" => self.read_output(3).await,
            "get_theta" => self.read_output(4).await,
            setter => {
                let parameter = setter.trim_start_matches("set_");
                let command = self.command_for(parameter, required(args, parameter)?, args)?;
                debug!(address = self.core.address(), %command, "SR830 setting");
                self.core.write(&command).await?;
                Ok(Value::Null)
            }
        }
    }
}

/// Factory for [`Sr830`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sr830Factory;

impl Sr830Factory {
    /// Class path of the SR830 driver
    pub const CLASS_PATH: &'static str = concat!(module_path!(), "::Sr830");
}

impl DriverFactory for Sr830Factory {
    fn class_path(&self) -> &str {
        Self::CLASS_PATH
    }

    fn identity_markers(&self) -> Vec<String> {
        vec!["SR830".to_string()]
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        [Capability::Scpi, Capability::Lockin].into_iter().collect()
    }

    fn contract(&self) -> CapabilityContract {
        let model = CapabilityContract::new()
            .with("reference_source", Constraint::one_of(REFERENCE_SOURCES))
            .with(
                "frequency",
                Constraint::conditional(
                    "reference_source",
                    [
                        ("internal", Constraint::range(0.001, 102_000.0)),
                        ("external", Constraint::Unconstrained),
                    ],
                ),
            )
            .with("harmonic", Constraint::range(1.0, 19_999.0))
            .with("phase", Constraint::range(-360.0, 729.99))
            .with("sine_voltage", Constraint::range(0.004, 5.0))
            .with("input_configuration", Constraint::one_of(INPUT_CONFIGURATIONS))
            .with("input_shield", Constraint::one_of(INPUT_SHIELDS))
            .with("notch_filter", Constraint::one_of(NOTCH_FILTERS))
            .with(
                "sensitivity",
                Constraint::conditional(
                    "input_configuration",
                    [
                        ("A", Constraint::one_of(VOLTAGE_SENSITIVITIES)),
                        ("A-B", Constraint::one_of(VOLTAGE_SENSITIVITIES)),
                        ("I (1M)", Constraint::one_of(CURRENT_SENSITIVITIES)),
                        ("I (100M)", Constraint::one_of(CURRENT_SENSITIVITIES)),
                    ],
                ),
            )
            .with("time_constant", Constraint::one_of(TIME_CONSTANTS))
            .with("filter_slope", Constraint::one_of(FILTER_SLOPES));
        lockin_contract().overlay(&model)
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Sr830 { core }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::ResolvedInstance;
    use crate::simulated::{SimulatedConnector, SimulatedDevice};
    use crate::transport::Connector;

    const ADDRESS: &str = "GPIB0::8::INSTR";

    async fn sr830(connector: &SimulatedConnector) -> ResolvedInstance {
        let transport = connector.open(ADDRESS).await.unwrap();
        let factory = Arc::new(Sr830Factory) as Arc<dyn DriverFactory>;
        ResolvedInstance::instantiate(&factory, ADDRESS, Some("SR830".into()), transport).unwrap()
    }

    fn connector() -> SimulatedConnector {
        SimulatedConnector::new().with_device(
            ADDRESS,
            SimulatedDevice::stream()
                .respond("OUTP? 1", "1.0234e-3")
                .respond("FREQ?", "1000.0"),
        )
    }

    #[test]
    fn test_model_contract_overlays_family() {
        let contract = Sr830Factory.contract();
        assert_eq!(contract.get("phase"), Some(&Constraint::range(-360.0, 729.99)));
        assert_eq!(contract.get("input_coupling"), lockin_contract().get("input_coupling"));
    }

    #[tokio::test]
    async fn test_frequency_depends_on_reference_source() {
        let connector = connector();
        let lockin = sr830(&connector).await;

        let args = CallArgs::new()
            .with("reference_source", "internal")
            .with("frequency", 200_000.0);
        assert!(matches!(
            lockin.call("configure", args).await,
            Err(DriverError::Contract(_))
        ));

        let args = CallArgs::new()
            .with("reference_source", "internal")
            .with("frequency", 1000.0);
        lockin.call("configure", args).await.unwrap();
        assert_eq!(connector.sent(ADDRESS), vec!["FMOD 1", "FREQ 1000"]);
    }

    #[tokio::test]
    async fn test_sensitivity_follows_recorded_input_configuration() {
        let connector = connector();
        let lockin = sr830(&connector).await;

        lockin
            .call("set_input_configuration", CallArgs::new().with("input_configuration", "I (1M)"))
            .await
            .unwrap();
        // Voltage sensitivities are not valid for the current inputs
        assert!(lockin
            .call("set_sensitivity", CallArgs::new().with("sensitivity", 0.5))
            .await
            .is_err());
        lockin
            .call("set_sensitivity", CallArgs::new().with("sensitivity", 5e-13))
            .await
            .unwrap();

        assert_eq!(connector.sent(ADDRESS), vec!["ISRC 2", "SENS 7"]);
    }

    #[tokio::test]
    async fn test_indexed_settings_and_reads() {
        let connector = connector();
        let lockin = sr830(&connector).await;

        let args = CallArgs::new()
            .with("time_constant", 0.3)
            .with("filter_slope", 24)
            .with("input_coupling", "dc")
            .with("sensitivity", 1e-3);
        lockin.call("configure", args).await.unwrap();
        assert_eq!(connector.sent(ADDRESS), vec!["ICPL 1", "SENS 17", "OFLT 9", "OFSL 3"]);

        assert_eq!(lockin.call("get_x", CallArgs::new()).await.unwrap(), Value::Float(1.0234e-3));
        assert_eq!(
            lockin.call("get_frequency", CallArgs::new()).await.unwrap(),
            Value::Float(1000.0)
        );
    }
}
