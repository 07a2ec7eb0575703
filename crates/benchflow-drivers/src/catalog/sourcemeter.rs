/*!
 * Keithley 2400 series source-measure unit.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;

use benchflow_core::types::Value;

use crate::catalog::on_off;
use crate::contract::{CallArgs, CapabilityContract, Constraint};
use crate::driver::{reply_value, required, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::{DriverError, Result};

/// Keithley 2400 driver
#[derive(Debug)]
pub struct Keithley2400 {
    core: InstrumentCore,
}

impl Keithley2400 {
    async fn set(&self, template: &str, args: &CallArgs, parameter: &str) -> Result<Value> {
        let value = required(args, parameter)?;
        self.core.write(&format!("{} {}", template, value)).await?;
        Ok(Value::Null)
    }

    async fn set_keyword(&self, template: &str, args: &CallArgs, parameter: &str) -> Result<Value> {
        let value = required(args, parameter)?.to_string().to_uppercase();
        self.core.write(&format!("{} {}", template, value)).await?;
        Ok(Value::Null)
    }

    /// Field of the comma-separated `:READ?` reply (voltage, current, resistance)
    async fn read_field(&self, index: usize) -> Result<Value> {
        let reply = self.core.query(":READ?").await?;
        reply
            .split(',')
            .nth(index)
            .map(|field| reply_value(field.trim().to_string()))
            .ok_or_else(|| DriverError::other(format!("Short :READ? reply: {}", reply)))
    }
}

#[async_trait]
impl Driver for Keithley2400 {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        vec![
            "output",
            "set_source_function",
            "set_sense_function",
            "set_sense_mode",
            "set_source_voltage",
            "set_source_current",
            "set_voltage_compliance",
            "set_current_compliance",
            "configure_voltage_source",
            "configure_current_source",
            "quick_read",
            "get_voltage",
            "get_current",
            "get_resistance",
        ]
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        match operation {
            "output" => {
                let state = on_off(required(args, "on")?);
                self.core.write(&format!(":OUTP {}", state)).await?;
                Ok(Value::Null)
            }
            "set_source_function" => self.set_keyword(":SOUR:FUNC", args, "source_func").await,
            "set_sense_function" => {
                let func = required(args, "sense_func")?.to_string().to_uppercase();
                self.core.write(&format!(":SENS:FUNC \"{}\"", func)).await?;
                Ok(Value::Null)
            }
            "set_sense_mode" => {
                let remote = required(args, "sense_mode")?.normalized() == "4w";
                self.core.write(&format!(":SYST:RSEN {}", if remote { "ON" } else { "OFF" })).await?;
                Ok(Value::Null)
            }
            "set_source_voltage" => self.set(":SOUR:VOLT:LEV", args, "voltage").await,
            "set_source_current" => self.set(":SOUR:CURR:LEV", args, "current").await,
            "set_voltage_compliance" => self.set(":SENS:VOLT:PROT", args, "voltage_compliance").await,
            "set_current_compliance" => self.set(":SENS:CURR:PROT", args, "current_compliance").await,
            "configure_voltage_source" => {
                self.core.write(":SOUR:FUNC VOLT").await?;
                self.set(":SOUR:VOLT:LEV", args, "voltage").await?;
                if args.get("current_compliance").is_some() {
                    self.set(":SENS:CURR:PROT", args, "current_compliance").await?;
                }
                Ok(Value::Null)
            }
            "configure_current_source" => {
                self.core.write(":SOUR:FUNC CURR").await?;
                self.set(":SOUR:CURR:LEV", args, "current").await?;
                if args.get("voltage_compliance").is_some() {
                    self.set(":SENS:VOLT:PROT", args, "voltage_compliance").await?;
                }
                Ok(Value::Null)
            }
            "quick_read" => Ok(Value::String(self.core.query(":READ?").await?)),
            "get_voltage" => self.read_field(0).await,
            "get_current" => self.read_field(1).await,
            _ => self.read_field(2).await,
        }
    }
}

/// Factory for [`Keithley2400`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Keithley2400Factory;

impl Keithley2400Factory {
    /// Class path of the 2400 driver
    pub const CLASS_PATH: &'static str = concat!(module_path!(), "::Keithley2400");
}

impl DriverFactory for Keithley2400Factory {
    fn class_path(&self) -> &str {
        Self::CLASS_PATH
    }

    fn identity_markers(&self) -> Vec<String> {
        vec!["MODEL 2400".to_string()]
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        [Capability::Scpi, Capability::SourceMeter].into_iter().collect()
    }

    fn contract(&self) -> CapabilityContract {
        CapabilityContract::new()
            .with("source_func", Constraint::one_of(["VOLT", "CURR"]))
            .with("sense_func", Constraint::one_of(["VOLT", "CURR", "RES"]))
            .with("sense_mode", Constraint::one_of(["2W", "4W"]))
            .with("voltage", Constraint::range(-210.0, 210.0))
            .with("current", Constraint::range(-1.05, 1.05))
            .with("voltage_compliance", Constraint::range(-210.0, 210.0))
            .with("current_compliance", Constraint::range(-1.05, 1.05))
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Keithley2400 { core }))
    }
}
