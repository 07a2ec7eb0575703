/*!
 * Keithley 193A digital multimeter.
 *
 * The 193A predates `*IDN?`. It is identified from its status reply, and
 * its readings arrive with a four-letter function prefix such as `NDCV`.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;

use benchflow_core::types::Value;

use crate::catalog::position;
use crate::contract::{CallArgs, CapabilityContract, Constraint};
use crate::driver::{reply_value, required, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::{DriverError, Result};

const RANGES: [f64; 5] = [0.2, 2.0, 20.0, 200.0, 1000.0];

/// Keithley 193A driver
#[derive(Debug)]
pub struct Keithley193a {
    core: InstrumentCore,
}

impl Keithley193a {
    fn function_code(args: &CallArgs, recorded: Option<Value>) -> Result<u8> {
        let func = required(args, "sense_func")?.normalized();
        let ac = args
            .get("coupling")
            .cloned()
            .or(recorded)
            .map(|c| c.normalized() == "ac")
            .unwrap_or(false);
        let code = match (func.as_str(), ac) {
            ("voltage", false) => 0,
            ("voltage", true) => 1,
            ("resistance", _) => 2,
            ("current", false) => 3,
            ("current", true) => 4,
            (other, _) => return Err(DriverError::other(format!("No 193A function {}", other))),
        };
        Ok(code)
    }

    async fn reading(&self) -> Result<Value> {
        let reply = self.core.query("X").await?;
        let number = reply.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        Ok(reply_value(number.to_string()))
    }
}

#[async_trait]
impl Driver for Keithley193a {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        vec!["set_sense_function", "set_sense_range", "get_reading", "get_voltage"]
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        match operation {
            "set_sense_function" => {
                let code = Self::function_code(args, self.core.current("coupling"))?;
                self.core.write(&format!("F{}X", code)).await?;
                Ok(Value::Null)
            }
            "set_sense_range" => {
                let range = required(args, "range")?;
                let code = if range.normalized() == "auto" {
                    0
                } else {
                    position(&RANGES, range)
                        .map(|i| i + 1)
                        .ok_or_else(|| DriverError::other(format!("No 193A range {}", range)))?
                };
                self.core.write(&format!("R{}X", code)).await?;
                Ok(Value::Null)
            }
            "get_voltage" => {
                if self.core.current("sense_func").map(|f| f.normalized()) != Some("voltage".into()) {
                    self.core.write("F0X").await?;
                }
                self.reading().await
            }
            _ => self.reading().await,
        }
    }
}

/// Factory for [`Keithley193a`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Keithley193aFactory;

impl Keithley193aFactory {
    /// Class path of the 193A driver
    pub const CLASS_PATH: &'static str = concat!(module_path!(), "::Keithley193a");
}

impl DriverFactory for Keithley193aFactory {
    fn class_path(&self) -> &str {
        Self::CLASS_PATH
    }

    fn identity_markers(&self) -> Vec<String> {
        vec!["Keithley 193A".to_string(), "NDCV".to_string()]
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        [Capability::Dmm].into_iter().collect()
    }

    fn contract(&self) -> CapabilityContract {
        let mut ranges = vec![Value::from("auto")];
        ranges.extend(RANGES.iter().map(|r| Value::from(*r)));

        CapabilityContract::new()
            .with("sense_func", Constraint::one_of(["voltage", "current", "resistance"]))
            .with("coupling", Constraint::one_of(["AC", "DC"]))
            .with("range", Constraint::Enumeration { members: ranges })
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Keithley193a { core }))
    }
}
