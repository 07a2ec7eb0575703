/*!
 * Measurement Computing USB-231 data acquisition board.
 *
 * The board sits on a local bus rather than a query channel, so the
 * driver only issues output commands.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;

use benchflow_core::types::Value;

use crate::catalog::channel;
use crate::contract::{CallArgs, CapabilityContract, Constraint};
use crate::driver::{required, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::Result;

/// USB-231 driver
#[derive(Debug)]
pub struct Usb231 {
    core: InstrumentCore,
}

#[async_trait]
impl Driver for Usb231 {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        vec!["v_out", "d_out"]
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        match operation {
            "v_out" => {
                let voltage = required(args, "voltage")?;
                self.core
                    .write(&format!("AOUT {} {}", channel(args, 0), voltage))
                    .await?;
            }
            _ => {
                let bit = required(args, "bit")?;
                let level = required(args, "level")?;
                self.core.write(&format!("DBIT {} {}", bit, level)).await?;
            }
        }
        Ok(Value::Null)
    }
}

/// Factory for [`Usb231`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Usb231Factory;

impl Usb231Factory {
    /// Class path of the USB-231 driver
    pub const CLASS_PATH: &'static str = concat!(module_path!(), "::Usb231");
}

impl DriverFactory for Usb231Factory {
    fn class_path(&self) -> &str {
        Self::CLASS_PATH
    }

    fn identity_markers(&self) -> Vec<String> {
        vec!["USB-231".to_string()]
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        [Capability::Daq].into_iter().collect()
    }

    fn contract(&self) -> CapabilityContract {
        CapabilityContract::new()
            .with("channel", Constraint::one_of([0, 1]))
            .with("voltage", Constraint::range(-10.0, 10.0))
            .with("bit", Constraint::range(0.0, 7.0))
            .with("level", Constraint::one_of([0, 1]))
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Usb231 { core }))
    }
}
