/*!
 * Arbitrary waveform generators.
 *
 * The Agilent 81150A narrows its frequency and amplitude windows when the
 * output is routed through the high-voltage amplifier, so
 * `configure_output_amplifier` rewrites the instance contract in place.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use benchflow_core::types::Value;

use crate::catalog::{channel, on_off};
use crate::contract::{CallArgs, CapabilityContract, Constraint};
use crate::driver::{required, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::Result;

const FUNCTIONS: [&str; 7] = ["SIN", "SQU", "RAMP", "PULS", "NOIS", "DC", "USER"];
const AMPLIFIERS: [&str; 2] = ["HIB", "HIV"];

/// Order in which `configure_waveform` applies settings
const WAVEFORM_SETTINGS: [&str; 8] = [
    "func",
    "frequency",
    "amplitude",
    "offset",
    "duty_cycle",
    "polarity",
    "load_impedance",
    "source_impedance",
];
const PULSE_SETTINGS: [&str; 2] = ["pulse_width", "pulse_delay"];
const TRIGGER_SETTINGS: [&str; 3] = ["trigger_source", "trigger_slope", "trigger_mode"];

/// Envelope shared by every waveform generator
pub fn awg_contract() -> CapabilityContract {
    CapabilityContract::new()
        .with("channel", Constraint::at_least(1.0))
        .with("amplitude", Constraint::at_least(0.0))
        .with("duty_cycle", Constraint::range(0.0, 100.0))
}

/// Frequency windows per waveform for one amplifier routing
fn frequency_windows(sine: f64, square: f64) -> Constraint {
    Constraint::conditional(
        "func",
        [
            ("SIN", Constraint::range(1e-6, sine)),
            ("SQU", Constraint::range(1e-6, square)),
            ("RAMP", Constraint::range(1e-6, 5e6)),
            ("PULS", Constraint::range(1e-6, square)),
            ("USER", Constraint::range(1e-6, square)),
            ("NOIS", Constraint::Unconstrained),
            ("DC", Constraint::Unconstrained),
        ],
    )
}

/// Agilent 81150A pulse function arbitrary noise generator
#[derive(Debug)]
pub struct Agilent81150a {
    core: InstrumentCore,
}

impl Agilent81150a {
    fn command_for(parameter: &str, ch: i64, value: &Value) -> Option<String> {
        let keyword = value.to_string().to_uppercase();
        let command = match parameter {
            "func" => format!(":FUNC{} {}", ch, keyword),
            "frequency" => format!(":FREQ{} {}", ch, value),
            "amplitude" => format!(":VOLT{} {}", ch, value),
            "offset" => format!(":VOLT{}:OFFS {}", ch, value),
            "duty_cycle" => format!(":FUNC{}:SQU:DCYC {}", ch, value),
            "polarity" => format!(":OUTP{}:POL {}", ch, keyword),
            "load_impedance" => format!(":OUTP{}:LOAD {}", ch, value),
            "source_impedance" => format!(":OUTP{}:IMP {}", ch, value),
            "pulse_width" => format!(":PULS:WIDT{} {}", ch, value),
            "pulse_delay" => format!(":PULS:DEL{} {}", ch, value),
            "trigger_source" => format!(":ARM:SOUR{} {}", ch, keyword),
            "trigger_slope" => format!(":ARM:SLOP{} {}", ch, keyword),
            "trigger_mode" => format!(":ARM:SENS{} {}", ch, keyword),
            _ => return None,
        };
        Some(command)
    }

    async fn apply(&self, settings: &[&str], args: &CallArgs) -> Result<Value> {
        let ch = channel(args, 1);
        for parameter in settings {
            if let Some(command) = args
                .get(parameter)
                .and_then(|value| Self::command_for(parameter, ch, value))
            {
                self.core.write(&command).await?;
            }
        }
        Ok(Value::Null)
    }

    async fn configure_output_amplifier(&self, args: &CallArgs) -> Result<Value> {
        let ch = channel(args, 1);
        let amplifier = required(args, "amplifier")?.to_string().to_uppercase();

        let (ceiling, frequency) = if amplifier == "HIV" {
            (10.0, frequency_windows(50e6, 50e6))
        } else {
            (5.0, frequency_windows(240e6, 120e6))
        };
        // The envelope follows the device only once it has switched
        self.core.write(&format!("OUTP{}:ROUT {}", ch, amplifier)).await?;

        self.core.set_constraint("amplitude", Constraint::range(0.0, ceiling))?;
        self.core.set_constraint("offset", Constraint::range(0.0, ceiling))?;
        self.core.set_constraint("frequency", frequency)?;
        info!(address = self.core.address(), channel = ch, %amplifier, "Output amplifier changed");
        Ok(Value::Null)
    }
}

#[async_trait]
impl Driver for Agilent81150a {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        vec![
            "configure_waveform",
            "configure_pulse",
            "configure_trigger",
            "configure_output_amplifier",
            "output_enable",
            "trigger",
        ]
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        match operation {
            "configure_waveform" => self.apply(&WAVEFORM_SETTINGS, args).await,
            "configure_pulse" => self.apply(&PULSE_SETTINGS, args).await,
            "configure_trigger" => self.apply(&TRIGGER_SETTINGS, args).await,
            "configure_output_amplifier" => self.configure_output_amplifier(args).await,
            "output_enable" => {
                let state = on_off(required(args, "on")?);
                self.core
                    .write(&format!(":OUTP{} {}", channel(args, 1), state))
                    .await?;
                Ok(Value::Null)
            }
            _ => {
                self.core.write("*TRG").await?;
                Ok(Value::Null)
            }
        }
    }
}

/// Factory for the 81150A driver
#[derive(Debug, Clone, Copy, Default)]
pub struct Agilent81150aFactory;

impl Agilent81150aFactory {
    /// Class path of the 81150A driver
    pub const CLASS_PATH: &'static str = concat!(module_path!(), "::Agilent81150a");
}

impl DriverFactory for Agilent81150aFactory {
    fn class_path(&self) -> &str {
        Self::CLASS_PATH
    }

    fn identity_markers(&self) -> Vec<String> {
        vec!["81150A".to_string()]
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        [Capability::Scpi, Capability::Awg].into_iter().collect()
    }

    fn contract(&self) -> CapabilityContract {
        let model = CapabilityContract::new()
            .with("channel", Constraint::one_of([1, 2]))
            .with("func", Constraint::one_of(FUNCTIONS))
            .with("frequency", frequency_windows(240e6, 120e6))
            .with("amplitude", Constraint::range(0.0, 5.0))
            .with("offset", Constraint::range(0.0, 5.0))
            .with("load_impedance", Constraint::range(0.3, 1e6))
            .with("source_impedance", Constraint::one_of([5, 50]))
            .with("polarity", Constraint::one_of(["NORM", "INV"]))
            .with("pulse_width", Constraint::range(4.1e-9, 950_000.0))
            .with("pulse_delay", Constraint::range(0.0, 999_000.0))
            .with("trigger_source", Constraint::one_of(["IMM", "INT2", "EXT", "BUS", "MAN"]))
            .with("trigger_slope", Constraint::one_of(["POS", "NEG", "EITH"]))
            .with("trigger_mode", Constraint::one_of(["EDGE", "LEV"]))
            .with("amplifier", Constraint::one_of(AMPLIFIERS));
        awg_contract().overlay(&model)
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Agilent81150a { core }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::ResolvedInstance;
    use crate::error::DriverError;
    use crate::simulated::{SimulatedConnector, SimulatedDevice};
    use crate::transport::Connector;

    const ADDRESS: &str = "GPIB0::10::INSTR";

    async fn awg(connector: &SimulatedConnector) -> ResolvedInstance {
        let transport = connector.open(ADDRESS).await.unwrap();
        let factory = Arc::new(Agilent81150aFactory) as Arc<dyn DriverFactory>;
        ResolvedInstance::instantiate(&factory, ADDRESS, Some("81150A".into()), transport).unwrap()
    }

    #[tokio::test]
    async fn test_waveform_window_depends_on_function() {
        let connector = SimulatedConnector::new().with_device(ADDRESS, SimulatedDevice::stream());
        let awg = awg(&connector).await;

        let ramp = CallArgs::new().with("func", "ramp").with("frequency", 10e6);
        assert!(matches!(
            awg.call("configure_waveform", ramp).await,
            Err(DriverError::Contract(_))
        ));

        let sine = CallArgs::new()
            .with("channel", 2)
            .with("func", "sin")
            .with("frequency", 10e6)
            .with("amplitude", 1.5);
        awg.call("configure_waveform", sine).await.unwrap();
        assert_eq!(
            connector.sent(ADDRESS),
            vec![":FUNC2 SIN", ":FREQ2 10000000", ":VOLT2 1.5"]
        );
    }

    #[tokio::test]
    async fn test_amplifier_rewrites_instance_contract() {
        let connector = SimulatedConnector::new().with_device(ADDRESS, SimulatedDevice::stream());
        let awg = awg(&connector).await;

        assert!(awg
            .call("configure_waveform", CallArgs::new().with("amplitude", 8.0))
            .await
            .is_err());

        awg.call(
            "configure_output_amplifier",
            CallArgs::new().with("channel", 1).with("amplifier", "HIV"),
        )
        .await
        .unwrap();
        awg.call("configure_waveform", CallArgs::new().with("amplitude", 8.0))
            .await
            .unwrap();

        // Sine tops out at 50 MHz behind the high-voltage amplifier
        let sine = CallArgs::new().with("func", "SIN").with("frequency", 100e6);
        assert!(awg.call("configure_waveform", sine).await.is_err());

        assert_eq!(connector.sent(ADDRESS), vec!["OUTP1:ROUT HIV", ":VOLT1 8"]);
        assert_eq!(
            Agilent81150aFactory.contract().get("amplitude"),
            Some(&Constraint::range(0.0, 5.0))
        );
    }

    #[tokio::test]
    async fn test_failed_amplifier_switch_keeps_contract() {
        let connector = SimulatedConnector::new().with_device(ADDRESS, SimulatedDevice::stream());
        let awg = awg(&connector).await;
        awg.core().transport().close().await.unwrap();

        let err = awg
            .call("configure_output_amplifier", CallArgs::new().with("amplifier", "HIV"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert_eq!(
            awg.core().contract().unwrap().get("amplitude"),
            Some(&Constraint::range(0.0, 5.0))
        );
        assert_eq!(awg.core().current("amplifier"), None);
    }

    #[tokio::test]
    async fn test_unknown_amplifier_rejected() {
        let connector = SimulatedConnector::new().with_device(ADDRESS, SimulatedDevice::stream());
        let awg = awg(&connector).await;
        let args = CallArgs::new().with("amplifier", "TURBO");
        assert!(awg.call("configure_output_amplifier", args).await.is_err());
        assert!(connector.sent(ADDRESS).is_empty());
    }

    #[tokio::test]
    async fn test_output_switch() {
        let connector = SimulatedConnector::new().with_device(ADDRESS, SimulatedDevice::stream());
        let awg = awg(&connector).await;
        awg.call("output_enable", CallArgs::new().with("on", true)).await.unwrap();
        awg.call("trigger", CallArgs::new()).await.unwrap();
        assert_eq!(connector.sent(ADDRESS), vec![":OUTP1 ON", "*TRG"]);
    }
}
